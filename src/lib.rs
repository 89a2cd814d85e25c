//! # nicolive-dl
//!
//! This crate records niconico live broadcasts. It checks whether the logged
//! in account may watch a broadcast (including trial watch for non-members),
//! joins the broadcast's control channel, and hands the announced stream to
//! `ffmpeg` while optionally saving the live comments next to the video.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use nicolive_dl::{
//!     auth::{self, Credentials},
//!     ffmpeg::Ffmpeg,
//!     util,
//!     worker::{self, DownloadOptions, OverwriteDecision},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     // Create HttpClient, a wrapper around reqwest::Client with a cookie
//!     // store and a middleware for retrying transient errors
//!     let client = util::HttpClient::new().unwrap();
//!
//!     // Log in; pass a closure returning the code if 2FA is enabled
//!     let credentials = Credentials {
//!         username: "user@example.com".to_string(),
//!         password: "password".to_string(),
//!     };
//!     auth::login(&client, &credentials, None::<fn() -> Option<String>>)
//!         .await
//!         .unwrap();
//!
//!     // Record the broadcast, never overwriting an existing file
//!     let options = DownloadOptions {
//!         save_comments: true,
//!         ..Default::default()
//!     };
//!     let keep = |_: &Path| OverwriteDecision::Abort;
//!     let result = worker::run(&client, &Ffmpeg::default(), &keep, "lv123456789", &options)
//!         .await
//!         .unwrap();
//!     println!("{:?}", result);
//! }
//! ```
//!
//! The `worker` module sequences everything: comments are only requested once
//! the control channel has announced the room, and `ffmpeg` only starts once
//! the stream address is known.

#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod auth;
pub mod availability;
pub mod comments;
pub mod embedded_data;
pub mod ffmpeg;
pub mod live_info;
pub mod session;
pub mod util;
pub mod worker;
