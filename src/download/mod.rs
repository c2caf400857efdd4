//! Concurrent chunked HTTP downloader.

pub mod manager;

pub use manager::{
    AuthSource, DownloadConfig, DownloadError, DownloadItem, DownloadManager, FileProgress,
};
