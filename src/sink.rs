//! 生成されたバイト列の書き込み先（バイトシンク）
//!
//! マルチプレクサーは [`ByteSink`] を通してのみ出力を行う。
//! メモリ上に全てを保持する [`MemorySink`] と、任意の出力先へ順次書き出す [`StreamSink`] の二つの実装がある。
use std::{
    io::{Seek, SeekFrom, Write},
    ops::Range,
    sync::mpsc::{Receiver, SyncSender, TrySendError},
};

use crate::{Error, Result};

/// チャンク単位の書き出しを有効にした場合のデフォルトのチャンクサイズ (16 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// 同時に保持する書き込み途中のチャンクの最大数
const MAX_CHUNKS_AT_ONCE: usize = 2;

/// 位置指定の書き込みをサポートするバイト列の書き込み先
pub trait ByteSink: Send {
    /// 現在位置に `data` を書き込み（既存の領域は上書きされる）、位置を進める
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 書き込み位置を変更する
    fn seek(&mut self, pos: u64);

    /// 現在の書き込み位置を返す
    fn pos(&self) -> u64;

    /// バッファリングされているデータを実際の出力先に書き出す
    ///
    /// 出力先が書き込みを受け付けられない場合には、受け付け可能になるまでブロックする
    fn flush(&mut self) -> Result<()>;

    /// 全ての書き込みを完了する
    fn finalize(&mut self) -> Result<()>;

    /// 出力先に渡されるバイト列が、常に前回の末尾から連続していることを要求するかどうかを設定する
    fn set_ensure_monotonicity(&mut self, _ensure: bool) {}

    /// メモリ上に保持している最終的なバイト列を取り出す
    ///
    /// メモリ上にバイト列を保持しないシンクの場合は `None` を返す
    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// メモリ上の可変長バッファに書き込むシンク
///
/// 一度書き込まれた領域は破棄されないため、任意の位置に戻って上書きできる
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Vec<u8>,
    pos: u64,
    max_pos: u64,
    finalized: bool,
}

impl MemorySink {
    const INITIAL_SIZE: usize = 64 * 1024;

    /// [`MemorySink`] インスタンスを生成する
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_size(&mut self, size: usize) {
        if size <= self.buffer.len() {
            return;
        }
        let mut new_size = self.buffer.len().max(Self::INITIAL_SIZE);
        while new_size < size {
            new_size *= 2;
        }
        self.buffer.resize(new_size, 0);
    }
}

impl ByteSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(Error::internal("Cannot write to a finalized memory sink"));
        }
        let start = usize::try_from(self.pos)
            .map_err(|_| Error::unsupported("Memory sink position exceeds the address space"))?;
        let end = start + data.len();
        self.ensure_size(end);
        self.buffer[start..end].copy_from_slice(data);
        self.pos = end as u64;
        self.max_pos = self.max_pos.max(self.pos);
        Ok(())
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.buffer.truncate(self.max_pos as usize);
        self.finalized = true;
        Ok(())
    }

    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.finalized.then(|| core::mem::take(&mut self.buffer))
    }
}

/// [`StreamDestination`] に渡されるバイト列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// ファイル先頭からのバイト位置
    pub position: u64,

    /// 書き込むバイト列
    pub data: Vec<u8>,
}

/// 出力先が追加の書き込みを受け付けられるかどうか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backpressure {
    /// 受け付け可能
    Ready,

    /// 受け付け不可（[`StreamDestination::wait_ready()`] で待つ必要がある）
    Full,
}

/// [`StreamSink`] の実際の出力先
pub trait StreamDestination: Send {
    /// `chunk` を出力先に書き込む
    fn write(&mut self, chunk: StreamChunk) -> Result<()>;

    /// 出力先の現在の受け付け状態を返す
    fn backpressure(&self) -> Backpressure {
        Backpressure::Ready
    }

    /// 出力先が書き込みを受け付け可能になるまでブロックする
    fn wait_ready(&mut self) -> Result<()> {
        Ok(())
    }

    /// 出力を完了する
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// シーク可能な [`std::io::Write`] 実装（ファイルなど）を出力先とする [`StreamDestination`]
#[derive(Debug)]
pub struct IoDestination<W> {
    inner: W,
}

impl<W: Write + Seek + Send> IoDestination<W> {
    /// [`IoDestination`] インスタンスを生成する
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// 内部の書き込み先を返す
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek + Send> StreamDestination for IoDestination<W> {
    fn write(&mut self, chunk: StreamChunk) -> Result<()> {
        self.inner.seek(SeekFrom::Start(chunk.position))?;
        self.inner.write_all(&chunk.data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// 有界チャネルの先にいる単一の書き込みタスクへチャンクを渡す [`StreamDestination`]
///
/// チャネルが一杯の場合は [`Backpressure::Full`] を報告し、
/// 受信側がチャンクを取り出すまで [`StreamDestination::wait_ready()`] がブロックする
#[derive(Debug)]
pub struct ChannelDestination {
    sender: Option<SyncSender<StreamChunk>>,
    pending: Option<StreamChunk>,
}

impl ChannelDestination {
    /// 容量 `capacity` のチャネルを作成して、送信側の出力先と受信側を返す
    ///
    /// 受信側は全てのチャンクを受け取った後に切断される
    pub fn bounded(capacity: usize) -> (Self, Receiver<StreamChunk>) {
        let (sender, receiver) = std::sync::mpsc::sync_channel(capacity);
        (
            Self {
                sender: Some(sender),
                pending: None,
            },
            receiver,
        )
    }

    fn sender(&self) -> Result<&SyncSender<StreamChunk>> {
        self.sender
            .as_ref()
            .ok_or_else(|| Error::invalid_input("Channel destination is already closed"))
    }
}

impl StreamDestination for ChannelDestination {
    fn write(&mut self, chunk: StreamChunk) -> Result<()> {
        self.wait_ready()?;
        match self.sender()?.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => {
                self.pending = Some(chunk);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::with_reason(
                crate::ErrorKind::Io,
                "Stream receiver has been dropped",
            )),
        }
    }

    fn backpressure(&self) -> Backpressure {
        if self.pending.is_some() {
            Backpressure::Full
        } else {
            Backpressure::Ready
        }
    }

    fn wait_ready(&mut self) -> Result<()> {
        if let Some(chunk) = self.pending.take() {
            self.sender()?.send(chunk).map_err(|_| {
                Error::with_reason(crate::ErrorKind::Io, "Stream receiver has been dropped")
            })?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.wait_ready()?;
        self.sender = None;
        Ok(())
    }
}

/// [`StreamSink`] 用のオプション
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// 固定サイズのチャンク単位でまとめて出力するかどうか
    pub chunked: bool,

    /// `chunked` が有効な場合のチャンクサイズ（バイト単位）
    pub chunk_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunked: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug)]
struct Section {
    start: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Chunk {
    start: u64,
    data: Vec<u8>,
    written: Vec<Range<usize>>,
    should_flush: bool,
}

/// 書き込まれたバイト列を順序付けて [`StreamDestination`] に渡すシンク
///
/// 順不同の書き込みは `flush()` 時に位置順に並べ替えられ、連続する領域ごとにまとめて出力される
#[derive(Debug)]
pub struct StreamSink<D> {
    destination: D,
    options: StreamOptions,
    sections: Vec<Section>,
    chunks: Vec<Chunk>,
    pos: u64,
    last_write_end: u64,
    last_flush_end: u64,
    ensure_monotonicity: bool,
}

impl<D: StreamDestination> StreamSink<D> {
    /// [`StreamSink`] インスタンスを生成する
    pub fn new(destination: D, options: StreamOptions) -> Result<Self> {
        if options.chunked && options.chunk_size < 1024 {
            return Err(Error::invalid_input(format!(
                "chunk_size must be at least 1024 bytes (got {})",
                options.chunk_size
            )));
        }
        Ok(Self {
            destination,
            options,
            sections: Vec::new(),
            chunks: Vec::new(),
            pos: 0,
            last_write_end: 0,
            last_flush_end: 0,
            ensure_monotonicity: false,
        })
    }

    fn merged_ranges(&self) -> Vec<Range<u64>> {
        let mut sorted: Vec<&Section> = self.sections.iter().collect();
        sorted.sort_by_key(|s| s.start);

        let mut ranges: Vec<Range<u64>> = Vec::new();
        for section in sorted {
            let end = section.start + section.data.len() as u64;
            if let Some(last) = ranges.last_mut()
                && section.start <= last.end
            {
                last.end = last.end.max(end);
                continue;
            }
            ranges.push(section.start..end);
        }
        ranges
    }

    fn emit(&mut self, position: u64, data: Vec<u8>) -> Result<()> {
        if self.ensure_monotonicity && position != self.last_flush_end {
            return Err(Error::internal(format!(
                "Monotonicity violation: expected write at {}, got {position}",
                self.last_flush_end
            )));
        }
        self.last_flush_end = position + data.len() as u64;
        self.destination.write(StreamChunk { position, data })
    }

    fn write_data_into_chunks(&mut self, mut data: &[u8], mut position: u64) -> Result<()> {
        let chunk_size = self.options.chunk_size;
        while !data.is_empty() {
            let index = match self
                .chunks
                .iter()
                .position(|c| c.start <= position && position < c.start + chunk_size as u64)
            {
                Some(index) => index,
                None => self.create_chunk(position),
            };

            let chunk = &mut self.chunks[index];
            let relative = (position - chunk.start) as usize;
            let n = (chunk_size - relative).min(data.len());
            chunk.data[relative..relative + n].copy_from_slice(&data[..n]);
            insert_range(&mut chunk.written, relative..relative + n);
            if chunk.written.first() == Some(&(0..chunk_size)) {
                chunk.should_flush = true;
            }

            if self.chunks.len() > MAX_CHUNKS_AT_ONCE {
                let last = self.chunks.len() - 1;
                for chunk in &mut self.chunks[..last] {
                    chunk.should_flush = true;
                }
                self.try_to_flush_chunks(false)?;
            }

            data = &data[n..];
            position += n as u64;
        }
        Ok(())
    }

    fn create_chunk(&mut self, includes_position: u64) -> usize {
        let chunk_size = self.options.chunk_size as u64;
        let start = includes_position / chunk_size * chunk_size;
        self.chunks.push(Chunk {
            start,
            data: vec![0; chunk_size as usize],
            written: Vec::new(),
            should_flush: false,
        });
        self.chunks.sort_by_key(|c| c.start);
        self.chunks
            .iter()
            .position(|c| c.start == start)
            .unwrap_or(self.chunks.len() - 1)
    }

    fn try_to_flush_chunks(&mut self, force: bool) -> Result<()> {
        let mut i = 0;
        while i < self.chunks.len() {
            if !self.chunks[i].should_flush && !force {
                i += 1;
                continue;
            }
            let chunk = self.chunks.remove(i);
            for range in &chunk.written {
                self.emit(chunk.start + range.start as u64, chunk.data[range.clone()].to_vec())?;
            }
        }
        Ok(())
    }
}

fn insert_range(ranges: &mut Vec<Range<usize>>, range: Range<usize>) {
    ranges.push(range);
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        if let Some(last) = merged.last_mut()
            && r.start <= last.end
        {
            last.end = last.end.max(r.end);
            continue;
        }
        merged.push(r);
    }
    *ranges = merged;
}

impl<D: StreamDestination> ByteSink for StreamSink<D> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.sections.push(Section {
            start: self.pos,
            data: data.to_vec(),
        });
        self.pos += data.len() as u64;
        self.last_write_end = self.last_write_end.max(self.pos);
        Ok(())
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn flush(&mut self) -> Result<()> {
        if self.pos > self.last_write_end {
            // 前方へのシークで生じた隙間はゼロで埋める
            let padding = (self.pos - self.last_write_end) as usize;
            self.pos = self.last_write_end;
            self.write(&vec![0; padding])?;
        }
        if self.sections.is_empty() {
            return Ok(());
        }

        for range in self.merged_ranges() {
            let mut data = vec![0; (range.end - range.start) as usize];
            // 後から書き込まれたものが優先されるように書き込み順に適用する
            for section in &self.sections {
                if range.start <= section.start && section.start < range.end {
                    let offset = (section.start - range.start) as usize;
                    data[offset..offset + section.data.len()].copy_from_slice(&section.data);
                }
            }

            if self.destination.backpressure() == Backpressure::Full {
                self.destination.wait_ready()?;
            }

            if self.options.chunked {
                self.write_data_into_chunks(&data, range.start)?;
                self.try_to_flush_chunks(false)?;
            } else {
                self.emit(range.start, data)?;
            }
        }
        self.sections.clear();
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.flush()?;
        if self.options.chunked {
            self.try_to_flush_chunks(true)?;
        }
        self.destination.close()
    }

    fn set_ensure_monotonicity(&mut self, ensure: bool) {
        self.ensure_monotonicity = ensure;
    }
}

/// 出力先の種類
pub enum Target {
    /// メモリ上のバッファ（完了後に [`Output::take_buffer()`](crate::mux::Output::take_buffer) で取得する）
    Memory,

    /// 任意の出力先へのストリーミング
    Stream(Box<dyn ByteSink>),
}

impl Target {
    /// メモリ上のバッファを出力先とする [`Target`] を生成する
    pub fn memory() -> Self {
        Self::Memory
    }

    /// `destination` へストリーミング出力する [`Target`] を生成する
    pub fn stream<D: StreamDestination + 'static>(
        destination: D,
        options: StreamOptions,
    ) -> Result<Self> {
        Ok(Self::Stream(Box::new(StreamSink::new(destination, options)?)))
    }

    pub(crate) fn into_sink(self) -> Box<dyn ByteSink> {
        match self {
            Self::Memory => Box::new(MemorySink::new()),
            Self::Stream(sink) => sink,
        }
    }
}

impl core::fmt::Debug for Target {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Memory => write!(f, "Target::Memory"),
            Self::Stream(_) => write!(f, "Target::Stream"),
        }
    }
}
