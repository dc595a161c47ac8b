//! Hand sign detection servers.
//!
//! `detect_server` answers single-frame detection requests, `stream_server` streams the local
//! camera as MJPEG with the detected sign drawn on top.
pub mod annotator;
pub mod control;
pub mod detector;
pub mod endpoints;
pub mod nn;
pub mod single_shot;
pub mod stats;
pub mod stream;
pub mod utils;
