//! [`ByteSink`] の上に整数やテキストの書き込み機能を提供するライター
use crate::{Result, sink::ByteSink};

#[derive(Debug)]
struct TrackedWrites {
    start: u64,
    end: u64,
    data: Vec<u8>,
}

/// ビッグエンディアンの整数などを書き込むためのライター
///
/// 計測用コールバックのために、特定区間に書き込まれたバイト列を記録する機能も持つ
pub struct Writer {
    sink: Box<dyn ByteSink>,
    tracked: Option<TrackedWrites>,
}

impl Writer {
    /// [`Writer`] インスタンスを生成する
    pub fn new(sink: Box<dyn ByteSink>) -> Self {
        Self {
            sink,
            tracked: None,
        }
    }

    /// 現在位置にバイト列を書き込む
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(tracked) = &mut self.tracked {
            let pos = self.sink.pos();
            if pos >= tracked.start {
                let offset = (pos - tracked.start) as usize;
                if tracked.data.len() < offset + data.len() {
                    tracked.data.resize(offset + data.len(), 0);
                }
                tracked.data[offset..offset + data.len()].copy_from_slice(data);
                tracked.end = tracked.end.max(pos + data.len() as u64);
            }
        }
        self.sink.write(data)
    }

    /// 8 ビット整数を書き込む
    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write(&[v])
    }

    /// 16 ビット整数を書き込む
    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    /// 24 ビット整数を書き込む
    pub fn write_u24(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_be_bytes()[1..])
    }

    /// 32 ビット整数を書き込む
    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    /// 64 ビット整数を書き込む
    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_be_bytes())
    }

    /// ASCII 文字列を書き込む
    pub fn write_ascii(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }

    /// 書き込み位置を変更する
    pub fn seek(&mut self, pos: u64) {
        self.sink.seek(pos);
    }

    /// 現在の書き込み位置を返す
    pub fn pos(&self) -> u64 {
        self.sink.pos()
    }

    /// バッファリングされたデータを出力先に書き出す
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }

    /// 書き込みを完了する
    pub fn finalize(&mut self) -> Result<()> {
        self.sink.finalize()
    }

    /// 出力の単調増加を要求するかどうかを設定する
    pub fn set_ensure_monotonicity(&mut self, ensure: bool) {
        self.sink.set_ensure_monotonicity(ensure);
    }

    /// メモリ上の最終的なバイト列を取り出す
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.sink.take_buffer()
    }

    /// 現在位置以降への書き込みの記録を開始する
    pub fn start_tracking_writes(&mut self) {
        let pos = self.sink.pos();
        self.tracked = Some(TrackedWrites {
            start: pos,
            end: pos,
            data: Vec::new(),
        });
    }

    /// 書き込みの記録を終了して、記録されたバイト列とその開始位置を返す
    pub fn stop_tracking_writes(&mut self) -> (Vec<u8>, u64) {
        match self.tracked.take() {
            Some(mut tracked) => {
                tracked.data.truncate((tracked.end - tracked.start) as usize);
                (tracked.data, tracked.start)
            }
            None => (Vec::new(), self.sink.pos()),
        }
    }
}

impl core::fmt::Debug for Writer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Writer")
            .field("pos", &self.sink.pos())
            .finish()
    }
}
