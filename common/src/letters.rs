//! Class index to letter table of the sign alphabet.
//!
//! The detector knows 24 static hand signs: the Latin alphabet without `J` and `Z`, which are
//! signed with motion and cannot be recognized from a single frame.

/// Number of classes the detector is trained on.
pub const NUM_CLASSES: usize = 24;

/// Letter for every class index, in training order.
pub const LETTERS: [char; NUM_CLASSES] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T',
    'U', 'V', 'W', 'X', 'Y',
];

/// Reported for class indices outside of the table.
pub const UNKNOWN_LETTER: char = '?';

/// Reported when nothing was detected.
pub const NO_LETTER: char = '-';

/// Map a class index to its letter, `UNKNOWN_LETTER` if out of range.
pub fn letter_for(class_index: usize) -> char {
    LETTERS.get(class_index).copied().unwrap_or(UNKNOWN_LETTER)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_table_skips_j_and_z() {
        assert!(!LETTERS.contains(&'J'));
        assert!(!LETTERS.contains(&'Z'));
        assert_eq!(letter_for(8), 'I');
        assert_eq!(letter_for(9), 'K');
        assert_eq!(letter_for(23), 'Y');
    }

    #[test]
    fn test_out_of_range_is_unknown() {
        assert_eq!(letter_for(24), UNKNOWN_LETTER);
        assert_eq!(letter_for(usize::MAX), UNKNOWN_LETTER);
    }
}
