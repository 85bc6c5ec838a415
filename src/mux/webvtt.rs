//! WebVTT キューの処理
use std::collections::VecDeque;

use crate::{
    Result,
    boxes::{Node, vtta, vttc, vtte},
    metadata::SubtitleCue,
};

/// `seconds` を `hh:mm:ss.mmm` 形式に変換する
pub(crate) fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round().max(0.0) as u64;
    let hours = total_ms / 3_600_000;
    let minutes = total_ms / 60_000 % 60;
    let secs = total_ms / 1000 % 60;
    let ms = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02}.{ms:03}")
}

/// `text[start..]` がキュー内タイムスタンプ `<[hh:]mm:ss.mmm>` で始まっていれば、その長さとミリ秒値を返す
fn match_inline_timestamp(text: &[u8], start: usize) -> Option<(usize, u64)> {
    let rest = text.get(start..)?;
    let end = rest.iter().position(|&b| b == b'>')?;
    let inner = rest.get(1..end).filter(|_| rest[0] == b'<')?;

    let digits = |s: &[u8], n: usize| -> Option<u64> {
        (s.len() == n && s.iter().all(u8::is_ascii_digit))
            .then(|| s.iter().fold(0, |acc, &b| acc * 10 + (b - b'0') as u64))
    };
    let (clock, millis) = inner.split_at(inner.iter().position(|&b| b == b'.')?);
    let millis = digits(&millis[1..], 3)?;
    let parts: Vec<&[u8]> = clock.split(|&b| b == b':').collect();
    let (hours, minutes, secs) = match parts.as_slice() {
        [m, s] => (0, digits(m, 2)?, digits(s, 2)?),
        [h, m, s] => (digits(h, 2)?, digits(m, 2)?, digits(s, 2)?),
        _ => return None,
    };
    let total = ((hours * 60 + minutes) * 60 + secs) * 1000 + millis;
    Some((end + 1, total))
}

/// キュー本文にキュー内タイムスタンプが含まれているかどうか
pub(crate) fn contains_inline_timestamp(text: &str) -> bool {
    let bytes = text.as_bytes();
    (0..bytes.len()).any(|i| bytes[i] == b'<' && match_inline_timestamp(bytes, i).is_some())
}

/// キュー内タイムスタンプをキューの開始時刻からの相対時刻に書き換える（Matroska 用）
pub(crate) fn rebase_inline_timestamps(text: &str, cue_start: f64) -> String {
    let base_ms = (cue_start * 1000.0).round() as i64;
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<'
            && let Some((len, ms)) = match_inline_timestamp(bytes, i)
        {
            out.push_str(&text[copied..i]);
            let relative = (ms as i64 - base_ms).max(0);
            out.push('<');
            out.push_str(&format_timestamp(relative as f64 / 1000.0));
            out.push('>');
            i += len;
            copied = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// ISO BMFF の 1 サンプル分の WebVTT データ
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WebVttSample {
    pub timestamp: f64,
    pub duration: f64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct QueuedCue {
    cue: SubtitleCue,
    source_id: Option<i32>,
}

/// 重なり合うキューを、重なりのない区間ごとのサンプルに分割する
///
/// 各サンプルはその区間に表示される全てのキュー (vttc) を含む。
/// キューの無い区間は空のサンプル (vtte) で埋められる。
/// 複数のサンプルにまたがるキューには同じソース ID (vsid) が振られる。
#[derive(Debug, Default)]
pub(crate) struct WebVttCueSplitter {
    queue: VecDeque<QueuedCue>,
    last_cue_end: f64,
    next_source_id: i32,
}

impl WebVttCueSplitter {
    pub fn push(&mut self, cue: SubtitleCue) {
        self.queue.push_back(QueuedCue {
            cue,
            source_id: None,
        });
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// `until` までに確定したサンプルを取り出す
    pub fn drain_until(&mut self, until: f64) -> Result<Vec<WebVttSample>> {
        let mut samples = Vec::new();
        while !self.queue.is_empty() {
            let mut boundaries: Vec<f64> = Vec::with_capacity(self.queue.len() * 2);
            for q in &self.queue {
                boundaries.push(q.cue.timestamp.max(self.last_cue_end));
                boundaries.push(q.cue.timestamp + q.cue.duration);
            }
            boundaries.sort_by(f64::total_cmp);
            boundaries.dedup();
            let sample_start = boundaries[0];
            let sample_end = boundaries.get(1).copied().unwrap_or(sample_start);
            if until < sample_end {
                break;
            }

            if self.last_cue_end < sample_start {
                samples.push(WebVttSample {
                    timestamp: self.last_cue_end,
                    duration: sample_start - self.last_cue_end,
                    data: vtte().to_bytes()?,
                });
                self.last_cue_end = sample_start;
            }

            let mut boxes = Vec::new();
            let mut i = 0;
            while i < self.queue.len() {
                let q = &mut self.queue[i];
                if q.cue.timestamp >= sample_end {
                    break;
                }
                let end = q.cue.timestamp + q.cue.duration;
                if q.source_id.is_none() && sample_end < end {
                    q.source_id = Some(self.next_source_id);
                    self.next_source_id += 1;
                }
                if let Some(notes) = &q.cue.notes {
                    boxes.push(vtta(notes));
                }
                let current_time =
                    contains_inline_timestamp(&q.cue.text).then(|| format_timestamp(sample_start));
                boxes.push(vttc(
                    &q.cue.text,
                    current_time.as_deref(),
                    q.cue.identifier.as_deref(),
                    q.cue.settings.as_deref(),
                    q.source_id,
                ));
                if end == sample_end {
                    self.queue.remove(i);
                } else {
                    i += 1;
                }
            }

            samples.push(WebVttSample {
                timestamp: sample_start,
                duration: sample_end - sample_start,
                data: Node::List(boxes).to_bytes()?,
            });
            self.last_cue_end = sample_end;
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_format() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(3723.5), "01:02:03.500");
    }

    #[test]
    fn inline_timestamps() {
        assert!(contains_inline_timestamp("a <00:01.500>b"));
        assert!(contains_inline_timestamp("<01:00:01.500>"));
        assert!(!contains_inline_timestamp("<b>bold</b>"));
        assert!(!contains_inline_timestamp("<0:01.500>"));
        assert_eq!(
            rebase_inline_timestamps("x <00:02.500>y", 2.0),
            "x <00:00:00.500>y"
        );
        assert_eq!(rebase_inline_timestamps("<i>plain</i>", 1.0), "<i>plain</i>");
    }

    fn tags(data: &[u8]) -> Vec<[u8; 4]> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            out.push(data[pos + 4..pos + 8].try_into().unwrap());
            pos += size;
        }
        out
    }

    #[test]
    fn overlapping_cues_are_split() {
        let mut splitter = WebVttCueSplitter::default();
        splitter.push(SubtitleCue::new("first", 1.0, 2.0));
        assert!(splitter.drain_until(1.0).unwrap().is_empty());
        splitter.push(SubtitleCue::new("second", 2.0, 2.0));

        let samples = splitter.drain_until(f64::INFINITY).unwrap();
        let spans: Vec<(f64, f64)> = samples.iter().map(|s| (s.timestamp, s.duration)).collect();
        assert_eq!(spans, [(0.0, 1.0), (1.0, 1.0), (2.0, 1.0), (3.0, 1.0)]);
        assert_eq!(tags(&samples[0].data), [*b"vtte"]);
        assert_eq!(tags(&samples[1].data), [*b"vttc"]);
        assert_eq!(tags(&samples[2].data), [*b"vttc", *b"vttc"]);
        assert_eq!(tags(&samples[3].data), [*b"vttc"]);
        assert_eq!(splitter.queued_len(), 0);
    }
}
