//! エンコード済みの音声・映像・字幕パケットを MP4 / MOV / MKV / WebM にまとめるマルチプレックスライブラリ
//!
//! 入力は [`metadata`] モジュールの型で表現し、[`mux::Output`] に渡す。
//! 出力先は [`sink::Target`] で指定する。
#![warn(missing_docs)]

pub mod bits;
pub mod boxes;
pub mod codec;
pub mod ebml;
mod error;
pub mod metadata;
pub mod mux;
pub mod sink;
pub mod writer;

pub use error::{Error, ErrorKind, Result};
