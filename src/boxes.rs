//! ISO BMFF のボックスツリーとその書き込み処理
//!
//! ボックスは [`Node`] のツリーとして組み立てられ、[`Node::write_to()`] で
//! 「プレースホルダーのヘッダを書く → 中身を書く → 戻ってサイズを埋める」の手順で書き込まれる。
use crate::{
    Error, Result,
    metadata::{MetadataTags, RawTagValue, VideoColorSpace},
    sink::MemorySink,
    writer::Writer,
};

/// 通常のボックスヘッダのサイズ
pub const BOX_HEADER_SIZE: u64 = 8;

/// 64 ビットサイズを持つボックスヘッダのサイズ
pub const LARGE_BOX_HEADER_SIZE: u64 = 16;

/// ムービー全体のタイムスケール
pub(crate) const GLOBAL_TIMESCALE: u32 = 1000;

/// 1904-01-01 から 1970-01-01 までの秒数
pub(crate) const MAC_EPOCH_OFFSET: u64 = 2_082_844_800;

/// ボックスツリーのノード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// そのまま書き込まれるバイト列
    Bytes(Vec<u8>),

    /// 順に書き込まれるノード列
    List(Vec<Node>),

    /// ボックス
    Box(BoxNode),
}

/// ボックス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxNode {
    /// ボックス種別
    pub box_type: [u8; 4],

    /// ヘッダ直後に書き込まれるペイロード
    pub contents: Vec<u8>,

    /// ペイロードに続く子ノード
    pub children: Vec<Node>,

    /// サイズが 32 ビットに収まる場合でも 64 ビットのサイズフィールドを使うかどうか
    pub large_size: bool,
}

impl From<BoxNode> for Node {
    fn from(b: BoxNode) -> Self {
        Self::Box(b)
    }
}

impl From<Vec<u8>> for Node {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Option<Node>> for Node {
    fn from(node: Option<Node>) -> Self {
        node.unwrap_or(Self::List(Vec::new()))
    }
}

/// 通常のボックスを生成する
pub fn boxed(box_type: &[u8; 4], contents: Vec<u8>, children: Vec<Node>) -> Node {
    Node::Box(BoxNode {
        box_type: *box_type,
        contents,
        children,
        large_size: false,
    })
}

/// フルボックス（version と flags を持つボックス）を生成する
pub fn full_box(
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
    contents: Vec<u8>,
    children: Vec<Node>,
) -> Node {
    let mut payload = Vec::with_capacity(4 + contents.len());
    payload.put_u8(version);
    payload.put_u24(flags);
    payload.extend_from_slice(&contents);
    boxed(box_type, payload, children)
}

impl BoxNode {
    fn payload_size(&self) -> u64 {
        self.contents.len() as u64 + self.children.iter().map(Node::size).sum::<u64>()
    }

    fn is_large(&self) -> bool {
        self.large_size || BOX_HEADER_SIZE + self.payload_size() > u32::MAX as u64
    }

    /// ヘッダ込みのサイズを返す
    pub fn size(&self) -> u64 {
        let header = if self.is_large() {
            LARGE_BOX_HEADER_SIZE
        } else {
            BOX_HEADER_SIZE
        };
        header + self.payload_size()
    }
}

impl Node {
    /// 書き込まれるバイト数を計算する
    pub fn size(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::List(nodes) => nodes.iter().map(Self::size).sum(),
            Self::Box(b) => b.size(),
        }
    }

    /// ノードを書き込む
    ///
    /// ボックスのサイズは子の書き込み後に書き戻される。
    /// 実際に書き込まれたサイズが計算値と一致しない場合は [`ErrorKind::Internal`](crate::ErrorKind::Internal) エラーになる。
    pub fn write_to(&self, writer: &mut Writer) -> Result<()> {
        match self {
            Self::Bytes(b) => writer.write(b),
            Self::List(nodes) => {
                for node in nodes {
                    node.write_to(writer)?;
                }
                Ok(())
            }
            Self::Box(b) => {
                let start = writer.pos();
                let expected = b.size();
                let large = b.is_large();
                let header_size = if large {
                    LARGE_BOX_HEADER_SIZE
                } else {
                    BOX_HEADER_SIZE
                };
                writer.write(&[0; LARGE_BOX_HEADER_SIZE as usize][..header_size as usize])?;
                writer.write(&b.contents)?;
                for child in &b.children {
                    child.write_to(writer)?;
                }
                let end = writer.pos();
                if end - start != expected {
                    return Err(Error::internal(format!(
                        "Size mismatch in '{}' box: measured {expected} bytes, wrote {} bytes",
                        String::from_utf8_lossy(&b.box_type),
                        end - start
                    )));
                }

                writer.seek(start);
                writer.write(&box_header(&b.box_type, expected, large))?;
                writer.seek(end);
                Ok(())
            }
        }
    }

    /// ノードをバイト列に変換する
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Box::new(MemorySink::new()));
        self.write_to(&mut writer)?;
        writer.finalize()?;
        writer
            .take_buffer()
            .ok_or_else(|| Error::internal("Memory sink did not return its buffer"))
    }
}

/// ボックスヘッダのバイト列を生成する（`size` はヘッダ込みのサイズ）
pub fn box_header(box_type: &[u8; 4], size: u64, large: bool) -> Vec<u8> {
    let mut header = Vec::with_capacity(LARGE_BOX_HEADER_SIZE as usize);
    if large {
        header.put_u32(1);
        header.extend_from_slice(box_type);
        header.put_u64(size);
    } else {
        header.put_u32(size as u32);
        header.extend_from_slice(box_type);
    }
    header
}

/// バイト列の末尾にビッグエンディアンの値を追加するためのヘルパー
pub(crate) trait PutBytes {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u24(&mut self, v: u32);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_i16(&mut self, v: i16);
    fn put_i32(&mut self, v: i32);
    fn put_zeros(&mut self, n: usize);
    fn put_ascii(&mut self, text: &str);

    /// 符号付き 16.16 固定小数点数
    fn put_fixed_16_16(&mut self, v: f64) {
        self.put_i32((v * 65536.0).round() as i32);
    }

    /// 符号付き 8.8 固定小数点数
    fn put_fixed_8_8(&mut self, v: f64) {
        self.put_i16((v * 256.0).round() as i16);
    }

    /// 符号付き 2.30 固定小数点数
    fn put_fixed_2_30(&mut self, v: f64) {
        self.put_i32((v * 1_073_741_824.0).round() as i32);
    }
}

impl PutBytes for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u24(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i16(&mut self, v: i16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_zeros(&mut self, n: usize) {
        self.resize(self.len() + n, 0);
    }

    fn put_ascii(&mut self, text: &str) {
        self.extend_from_slice(text.as_bytes());
    }
}

/// ftyp ボックスのブランドの選び方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FtypKind {
    QuickTime,
    Fragmented,
    Standard { holds_avc: bool },
}

pub(crate) fn ftyp(kind: FtypKind) -> Node {
    let mut c = Vec::new();
    match kind {
        FtypKind::QuickTime => {
            c.put_ascii("qt  ");
            c.put_u32(0x200);
            c.put_ascii("qt  ");
        }
        FtypKind::Fragmented => {
            c.put_ascii("iso5");
            c.put_u32(0x200);
            c.put_ascii("iso5");
            c.put_ascii("iso6");
            c.put_ascii("mp41");
        }
        FtypKind::Standard { holds_avc } => {
            c.put_ascii("isom");
            c.put_u32(0x200);
            c.put_ascii("isom");
            if holds_avc {
                c.put_ascii("avc1");
            }
            c.put_ascii("mp41");
        }
    }
    boxed(b"ftyp", c, vec![])
}

fn put_u32_or_u64(c: &mut Vec<u8>, v: u64, wide: bool) {
    if wide {
        c.put_u64(v);
    } else {
        c.put_u32(v as u32);
    }
}

fn is_u32(v: u64) -> bool {
    v <= u32::MAX as u64
}

const IDENTITY_MATRIX: [f64; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// 時計回りに `degrees` 回転させる変換行列
fn rotation_matrix(degrees: i32) -> [f64; 9] {
    let theta = (degrees as f64).to_radians();
    let cos = theta.cos().round();
    let sin = theta.sin().round();
    [cos, sin, 0.0, -sin, cos, 0.0, 0.0, 0.0, 1.0]
}

fn put_matrix(c: &mut Vec<u8>, m: &[f64; 9]) {
    for (i, v) in m.iter().enumerate() {
        if i % 3 == 2 {
            c.put_fixed_2_30(*v);
        } else {
            c.put_fixed_16_16(*v);
        }
    }
}

pub(crate) fn mvhd(creation_time: u64, duration: u64, next_track_id: u32) -> Node {
    let wide = !is_u32(creation_time) || !is_u32(duration);
    let mut c = Vec::new();
    put_u32_or_u64(&mut c, creation_time, wide);
    put_u32_or_u64(&mut c, creation_time, wide);
    c.put_u32(GLOBAL_TIMESCALE);
    put_u32_or_u64(&mut c, duration, wide);
    c.put_fixed_16_16(1.0); // rate
    c.put_fixed_8_8(1.0); // volume
    c.put_zeros(10);
    put_matrix(&mut c, &IDENTITY_MATRIX);
    c.put_zeros(24);
    c.put_u32(next_track_id);
    full_box(b"mvhd", wide as u8, 0, c, vec![])
}

/// tkhd ボックスの内容
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackHeader {
    pub creation_time: u64,
    pub track_id: u32,
    pub duration: u64,
    pub enabled: bool,
    pub is_audio: bool,
    pub rotation: i32,
    pub width: u32,
    pub height: u32,
}

pub(crate) fn tkhd(h: &TrackHeader) -> Node {
    let wide = !is_u32(h.creation_time) || !is_u32(h.duration);
    let mut c = Vec::new();
    put_u32_or_u64(&mut c, h.creation_time, wide);
    put_u32_or_u64(&mut c, h.creation_time, wide);
    c.put_u32(h.track_id);
    c.put_u32(0);
    put_u32_or_u64(&mut c, h.duration, wide);
    c.put_zeros(8);
    c.put_u16(0); // layer
    c.put_u16(h.track_id as u16); // alternate group
    c.put_fixed_8_8(if h.is_audio { 1.0 } else { 0.0 });
    c.put_u16(0);
    put_matrix(&mut c, &rotation_matrix(h.rotation));
    c.put_fixed_16_16(h.width as f64);
    c.put_fixed_16_16(h.height as f64);

    // track_in_movie と track_enabled
    let flags = 0x2 | h.enabled as u32;
    full_box(b"tkhd", wide as u8, flags, c, vec![])
}

/// ISO 639-2/T の言語コードを 5 ビット × 3 の形式に変換する
fn language_code(language: &str) -> u16 {
    language
        .bytes()
        .take(3)
        .fold(0u16, |acc, b| (acc << 5) | (b.wrapping_sub(0x60) as u16 & 0x1f))
}

pub(crate) fn mdhd(creation_time: u64, timescale: u32, duration: u64, language: &str) -> Node {
    let wide = !is_u32(creation_time) || !is_u32(duration);
    let mut c = Vec::new();
    put_u32_or_u64(&mut c, creation_time, wide);
    put_u32_or_u64(&mut c, creation_time, wide);
    c.put_u32(timescale);
    put_u32_or_u64(&mut c, duration, wide);
    c.put_u16(language_code(language));
    c.put_u16(0);
    full_box(b"mdhd", wide as u8, 0, c, vec![])
}

pub(crate) fn hdlr(
    has_component_type: bool,
    handler_type: &str,
    name: &str,
    manufacturer: &[u8; 4],
) -> Node {
    let mut c = Vec::new();
    if has_component_type {
        c.put_ascii("mhlr");
    } else {
        c.put_u32(0);
    }
    c.put_ascii(handler_type);
    c.extend_from_slice(manufacturer);
    c.put_u32(0);
    c.put_u32(0);
    c.put_ascii(name);
    c.put_u8(0);
    full_box(b"hdlr", 0, 0, c, vec![])
}

pub(crate) fn vmhd() -> Node {
    full_box(b"vmhd", 0, 1, vec![0; 8], vec![])
}

pub(crate) fn smhd() -> Node {
    full_box(b"smhd", 0, 0, vec![0; 4], vec![])
}

pub(crate) fn nmhd() -> Node {
    full_box(b"nmhd", 0, 0, vec![], vec![])
}

pub(crate) fn dinf() -> Node {
    let url = full_box(b"url ", 0, 1, vec![], vec![]);
    let dref = full_box(b"dref", 0, 0, 1u32.to_be_bytes().to_vec(), vec![url]);
    boxed(b"dinf", vec![], vec![dref])
}

/// stts の 1 エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimeToSampleEntry {
    pub sample_count: u32,
    pub sample_delta: u32,
}

/// ctts の 1 エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompositionOffsetEntry {
    pub sample_count: u32,
    pub sample_offset: i32,
}

/// stsc の 1 エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SampleToChunkEntry {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

pub(crate) fn stsd(entry: Node) -> Node {
    full_box(b"stsd", 0, 0, 1u32.to_be_bytes().to_vec(), vec![entry])
}

pub(crate) fn stts(entries: &[TimeToSampleEntry]) -> Node {
    let mut c = Vec::with_capacity(4 + entries.len() * 8);
    c.put_u32(entries.len() as u32);
    for e in entries {
        c.put_u32(e.sample_count);
        c.put_u32(e.sample_delta);
    }
    full_box(b"stts", 0, 0, c, vec![])
}

/// ctts ボックスが必要かどうか（いずれかのオフセットが非ゼロの場合のみ必要）
pub(crate) fn needs_ctts(entries: &[CompositionOffsetEntry]) -> bool {
    entries.iter().any(|e| e.sample_offset != 0)
}

pub(crate) fn ctts(entries: &[CompositionOffsetEntry]) -> Node {
    let version = entries.iter().any(|e| e.sample_offset < 0) as u8;
    let mut c = Vec::with_capacity(4 + entries.len() * 8);
    c.put_u32(entries.len() as u32);
    for e in entries {
        c.put_u32(e.sample_count);
        c.put_i32(e.sample_offset);
    }
    full_box(b"ctts", version, 0, c, vec![])
}

pub(crate) fn stsc(entries: &[SampleToChunkEntry]) -> Node {
    let mut c = Vec::with_capacity(4 + entries.len() * 12);
    c.put_u32(entries.len() as u32);
    for e in entries {
        c.put_u32(e.first_chunk);
        c.put_u32(e.samples_per_chunk);
        c.put_u32(1); // sample_description_index
    }
    full_box(b"stsc", 0, 0, c, vec![])
}

pub(crate) fn stsz_variable(sizes: impl ExactSizeIterator<Item = u32>) -> Node {
    let mut c = Vec::with_capacity(8 + sizes.len() * 4);
    c.put_u32(0);
    c.put_u32(sizes.len() as u32);
    for size in sizes {
        c.put_u32(size);
    }
    full_box(b"stsz", 0, 0, c, vec![])
}

pub(crate) fn stsz_constant(sample_size: u32, sample_count: u32) -> Node {
    let mut c = Vec::with_capacity(8);
    c.put_u32(sample_size);
    c.put_u32(sample_count);
    full_box(b"stsz", 0, 0, c, vec![])
}

/// チャンクオフセットのボックスを生成する
///
/// 最後のオフセットが 32 ビットに収まらない場合は co64 になる
pub(crate) fn chunk_offsets(offsets: &[u64]) -> Node {
    let wide = offsets.last().is_some_and(|&o| !is_u32(o));
    let mut c = Vec::with_capacity(4 + offsets.len() * if wide { 8 } else { 4 });
    c.put_u32(offsets.len() as u32);
    for &offset in offsets {
        put_u32_or_u64(&mut c, offset, wide);
    }
    full_box(if wide { b"co64" } else { b"stco" }, 0, 0, c, vec![])
}

/// stss ボックスを生成する（`key_samples` は 0 始まりのサンプル番号）
pub(crate) fn stss(key_samples: &[u32]) -> Node {
    let mut c = Vec::with_capacity(4 + key_samples.len() * 4);
    c.put_u32(key_samples.len() as u32);
    for &index in key_samples {
        c.put_u32(index + 1);
    }
    full_box(b"stss", 0, 0, c, vec![])
}

pub(crate) fn video_sample_entry(
    box_type: &[u8; 4],
    width: u32,
    height: u32,
    children: Vec<Node>,
) -> Node {
    let mut c = Vec::with_capacity(78);
    c.put_zeros(6);
    c.put_u16(1); // data_reference_index
    c.put_u16(0);
    c.put_u16(0);
    c.put_zeros(12);
    c.put_u16(width as u16);
    c.put_u16(height as u16);
    c.put_u32(0x0048_0000); // 72 dpi
    c.put_u32(0x0048_0000);
    c.put_u32(0);
    c.put_u16(1); // frame_count
    c.put_zeros(32); // compressorname
    c.put_u16(0x0018); // depth
    c.put_i16(-1);
    boxed(box_type, c, children)
}

pub(crate) fn colr(color_space: &VideoColorSpace) -> Option<Node> {
    let (Some(primaries), Some(transfer), Some(matrix), Some(full_range)) = (
        color_space.primaries,
        color_space.transfer,
        color_space.matrix,
        color_space.full_range,
    ) else {
        return None;
    };
    let mut c = Vec::with_capacity(11);
    c.put_ascii("nclx");
    c.put_u16(primaries.code() as u16);
    c.put_u16(transfer.code() as u16);
    c.put_u16(matrix.code() as u16);
    c.put_u8((full_range as u8) << 7);
    Some(boxed(b"colr", c, vec![]))
}

/// 音声サンプルエントリーの内容
#[derive(Debug, Clone, Copy)]
pub(crate) struct SoundEntry {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_size_bits: u16,

    /// QuickTime の sound description version 1 を使うかどうか
    pub quicktime_v1: bool,
}

pub(crate) fn sound_sample_entry(box_type: &[u8; 4], e: &SoundEntry, children: Vec<Node>) -> Node {
    let mut c = Vec::with_capacity(44);
    c.put_zeros(6);
    c.put_u16(1); // data_reference_index
    c.put_u16(e.quicktime_v1 as u16);
    c.put_u16(0); // revision level
    c.put_u32(0); // vendor
    c.put_u16(e.channels);
    c.put_u16(if e.quicktime_v1 {
        e.sample_size_bits.min(16)
    } else {
        e.sample_size_bits
    });
    c.put_u16(0); // compression id
    c.put_u16(0); // packet size
    c.put_u16(if e.sample_rate < 1 << 16 {
        e.sample_rate as u16
    } else {
        0
    });
    c.put_u16(0);
    if e.quicktime_v1 {
        let bytes_per_sample = e.sample_size_bits as u32 / 8;
        c.put_u32(1); // samples per packet
        c.put_u32(bytes_per_sample);
        c.put_u32(e.channels as u32 * bytes_per_sample);
        c.put_u32(2);
    }
    boxed(box_type, c, children)
}

pub(crate) fn subtitle_sample_entry(box_type: &[u8; 4], children: Vec<Node>) -> Node {
    let mut c = Vec::with_capacity(8);
    c.put_zeros(6);
    c.put_u16(1);
    boxed(box_type, c, children)
}

/// デスクリプタのタグとサイズ（7 ビットごとの可変長表現）をエンコードする
fn put_tag_and_size(buf: &mut Vec<u8>, tag: u8, mut size: usize) {
    buf.put_u8(tag);
    let mut size_bytes = Vec::new();
    for i in 0.. {
        let mut b = (size & 0b0111_1111) as u8;
        size >>= 7;
        if i > 0 {
            b |= 0b1000_0000;
        }
        size_bytes.push(b);
        if size == 0 {
            break;
        }
    }
    size_bytes.reverse(); // リトルエンディアンからビッグエンディアンにする
    buf.extend_from_slice(&size_bytes);
}

/// esds ボックスを生成する
pub(crate) fn esds(object_type_indication: u8, decoder_specific_info: Option<&[u8]>) -> Node {
    let mut decoder_config = Vec::new();
    decoder_config.put_u8(object_type_indication);
    decoder_config.put_u8(0x15); // stream_type = 5 (audio), reserved = 1
    decoder_config.put_u24(0); // buffer_size_db
    decoder_config.put_u32(0); // max_bitrate
    decoder_config.put_u32(0); // avg_bitrate
    if let Some(info) = decoder_specific_info {
        put_tag_and_size(&mut decoder_config, 0x05, info.len());
        decoder_config.extend_from_slice(info);
    }

    let mut es = Vec::new();
    es.put_u16(1); // ES_ID
    es.put_u8(0);
    put_tag_and_size(&mut es, 0x04, decoder_config.len());
    es.extend_from_slice(&decoder_config);
    // SLConfigDescriptor (predefined = 2)
    es.extend_from_slice(&[0x06, 0x01, 0x02]);

    let mut c = Vec::new();
    put_tag_and_size(&mut c, 0x03, es.len());
    c.extend_from_slice(&es);
    full_box(b"esds", 0, 0, c, vec![])
}

pub(crate) fn pcmc(little_endian: bool, bits_per_sample: u8) -> Node {
    full_box(
        b"pcmC",
        0,
        0,
        vec![little_endian as u8, bits_per_sample],
        vec![],
    )
}

/// QuickTime の PCM 用 wave ボックス
pub(crate) fn wave(format: &[u8; 4], little_endian: bool) -> Node {
    boxed(
        b"wave",
        vec![],
        vec![
            boxed(b"frma", format.to_vec(), vec![]),
            boxed(b"enda", (little_endian as u16).to_be_bytes().to_vec(), vec![]),
            boxed(&[0; 4], vec![], vec![]),
        ],
    )
}

pub(crate) fn trex(track_id: u32) -> Node {
    let mut c = Vec::with_capacity(20);
    c.put_u32(track_id);
    c.put_u32(1); // default_sample_description_index
    c.put_u32(0);
    c.put_u32(0);
    c.put_u32(0);
    full_box(b"trex", 0, 0, c, vec![])
}

pub(crate) fn mfhd(sequence_number: u32) -> Node {
    full_box(b"mfhd", 0, 0, sequence_number.to_be_bytes().to_vec(), vec![])
}

/// フラグメント内のサンプルのフラグを返す
pub(crate) fn fragment_sample_flags(is_key: bool) -> u32 {
    if is_key {
        // sample_depends_on = 2
        2 << 24
    } else {
        // sample_depends_on = 1, sample_is_non_sync_sample = 1
        (1 << 24) | (1 << 16)
    }
}

/// trun に書き込まれるサンプル情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub is_key: bool,
    pub composition_offset: i32,
}

/// tfhd ボックスを生成する
///
/// 既定値には二番目のサンプル（なければ先頭のサンプル）の値が使われる
pub(crate) fn tfhd(track_id: u32, samples: &[FragmentSample]) -> Node {
    let reference = samples.get(1).or(samples.first());
    let mut c = Vec::with_capacity(16);
    c.put_u32(track_id);
    c.put_u32(reference.map_or(0, |s| s.duration));
    c.put_u32(reference.map_or(0, |s| s.size));
    c.put_u32(reference.map_or(0, |s| fragment_sample_flags(s.is_key)));

    // default-sample-duration, default-sample-size, default-sample-flags, default-base-is-moof
    let flags = 0x00008 | 0x00010 | 0x00020 | 0x20000;
    full_box(b"tfhd", 0, flags, c, vec![])
}

pub(crate) fn tfdt(base_media_decode_time: u64) -> Node {
    full_box(
        b"tfdt",
        1,
        0,
        base_media_decode_time.to_be_bytes().to_vec(),
        vec![],
    )
}

pub(crate) fn trun(samples: &[FragmentSample], data_offset: i32) -> Node {
    let flags: Vec<u32> = samples
        .iter()
        .map(|s| fragment_sample_flags(s.is_key))
        .collect();
    let distinct = |values: Vec<i64>| {
        let mut v = values;
        v.sort_unstable();
        v.dedup();
        v
    };
    let durations = distinct(samples.iter().map(|s| s.duration as i64).collect());
    let sizes = distinct(samples.iter().map(|s| s.size as i64).collect());
    let unique_flags = distinct(flags.iter().map(|&f| f as i64).collect());
    let offsets = distinct(samples.iter().map(|s| s.composition_offset as i64).collect());

    // 先頭サンプル以外のフラグが全て同じ場合のみ first-sample-flags で表現できる
    let first_sample_flags_present = flags.len() >= 2
        && flags[0] != flags[1]
        && flags[2..].iter().all(|&f| f == flags[1]);
    let duration_present = durations.len() > 1;
    let size_present = sizes.len() > 1;
    let flags_present = !first_sample_flags_present && unique_flags.len() > 1;
    let offsets_present = offsets.len() > 1 || offsets.iter().any(|&o| o != 0);

    let mut tr_flags = 0x0001; // data-offset-present
    if first_sample_flags_present {
        tr_flags |= 0x0004;
    }
    if duration_present {
        tr_flags |= 0x0100;
    }
    if size_present {
        tr_flags |= 0x0200;
    }
    if flags_present {
        tr_flags |= 0x0400;
    }
    if offsets_present {
        tr_flags |= 0x0800;
    }

    let mut c = Vec::with_capacity(12 + samples.len() * 16);
    c.put_u32(samples.len() as u32);
    c.put_i32(data_offset);
    if first_sample_flags_present {
        c.put_u32(flags[0]);
    }
    for (s, &f) in samples.iter().zip(&flags) {
        if duration_present {
            c.put_u32(s.duration);
        }
        if size_present {
            c.put_u32(s.size);
        }
        if flags_present {
            c.put_u32(f);
        }
        if offsets_present {
            c.put_i32(s.composition_offset);
        }
    }
    full_box(b"trun", 1, tr_flags, c, vec![])
}

/// tfra の 1 エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RandomAccessEntry {
    pub time: u64,
    pub moof_offset: u64,
    /// moof 内での traf の位置（1 始まり）
    pub traf_number: u32,
}

pub(crate) fn tfra(track_id: u32, entries: &[RandomAccessEntry]) -> Node {
    let mut c = Vec::with_capacity(12 + entries.len() * 28);
    c.put_u32(track_id);
    // traf_number, trun_number, sample_number をそれぞれ 32 ビットで表現する
    c.put_u32(0b11_1111);
    c.put_u32(entries.len() as u32);
    for e in entries {
        c.put_u64(e.time);
        c.put_u64(e.moof_offset);
        c.put_u32(e.traf_number);
        c.put_u32(1);
        c.put_u32(1);
    }
    full_box(b"tfra", 1, 0, c, vec![])
}

/// mfra ボックスを生成する（mfro には mfra 全体のサイズが入る）
pub(crate) fn mfra(tfras: Vec<Node>) -> Node {
    let mfro_size = BOX_HEADER_SIZE + 4 + 4;
    let total = BOX_HEADER_SIZE + tfras.iter().map(Node::size).sum::<u64>() + mfro_size;
    let mfro = full_box(b"mfro", 0, 0, (total as u32).to_be_bytes().to_vec(), vec![]);
    let mut children = tfras;
    children.push(mfro);
    boxed(b"mfra", vec![], children)
}

pub(crate) fn free(total_size: u64) -> Node {
    let payload = total_size.saturating_sub(BOX_HEADER_SIZE) as usize;
    boxed(b"free", vec![0; payload], vec![])
}

const ILST_TYPE_BINARY: u32 = 0;
const ILST_TYPE_UTF8: u32 = 1;
const ILST_TYPE_JPEG: u32 = 13;
const ILST_TYPE_PNG: u32 = 14;
const ILST_TYPE_BMP: u32 = 27;

fn ilst_data(data_type: u32, payload: &[u8]) -> Node {
    let mut c = Vec::with_capacity(8 + payload.len());
    c.put_u32(data_type);
    c.put_u32(0); // locale
    c.extend_from_slice(payload);
    boxed(b"data", c, vec![])
}

fn ilst_text(key: &[u8; 4], text: &str) -> Node {
    boxed(key, vec![], vec![ilst_data(ILST_TYPE_UTF8, text.as_bytes())])
}

/// `udta/meta/ilst` 形式のメタデータを生成する（タグが一つもなければ `None`）
pub(crate) fn udta_metadata(tags: &MetadataTags) -> Option<Node> {
    let mut entries = Vec::new();
    let texts: [(&[u8; 4], &Option<String>); 8] = [
        (b"\xa9nam", &tags.title),
        (b"desc", &tags.description),
        (b"\xa9ART", &tags.artist),
        (b"\xa9alb", &tags.album),
        (b"aART", &tags.album_artist),
        (b"\xa9gen", &tags.genre),
        (b"\xa9day", &tags.date),
        (b"\xa9cmt", &tags.comment),
    ];
    for (key, value) in texts {
        if let Some(value) = value {
            entries.push(ilst_text(key, value));
        }
    }

    let covers: Vec<Node> = tags
        .images
        .iter()
        .filter_map(|image| {
            let data_type = match image.mime_type.as_str() {
                "image/jpeg" => ILST_TYPE_JPEG,
                "image/png" => ILST_TYPE_PNG,
                "image/bmp" => ILST_TYPE_BMP,
                other => {
                    tracing::debug!(mime_type = other, "skipping cover image with unsupported type");
                    return None;
                }
            };
            Some(ilst_data(data_type, &image.data))
        })
        .collect();
    if !covers.is_empty() {
        entries.push(boxed(b"covr", vec![], covers));
    }

    for (key, value) in &tags.raw {
        let data = match value {
            RawTagValue::Text(text) => ilst_data(ILST_TYPE_UTF8, text.as_bytes()),
            RawTagValue::Binary(bytes) => ilst_data(ILST_TYPE_BINARY, bytes),
        };
        if let Ok(four_cc) = <[u8; 4]>::try_from(key.as_bytes()) {
            entries.push(boxed(&four_cc, vec![], vec![data]));
        } else {
            let mean = full_box(b"mean", 0, 0, b"com.apple.iTunes".to_vec(), vec![]);
            let name = full_box(b"name", 0, 0, key.as_bytes().to_vec(), vec![]);
            entries.push(boxed(b"----", vec![], vec![mean, name, data]));
        }
    }

    if entries.is_empty() {
        return None;
    }
    let meta = full_box(
        b"meta",
        0,
        0,
        vec![],
        vec![
            hdlr(false, "mdir", "", b"appl"),
            boxed(b"ilst", vec![], entries),
        ],
    );
    Some(boxed(b"udta", vec![], vec![meta]))
}

/// トラック名を格納する `udta/name` ボックス
pub(crate) fn track_name(name: &str) -> Node {
    boxed(
        b"udta",
        vec![],
        vec![boxed(b"name", name.as_bytes().to_vec(), vec![])],
    )
}

/// WebVTT の空区間を表すサンプル
pub(crate) fn vtte() -> Node {
    boxed(b"vtte", vec![], vec![])
}

/// WebVTT のコメントを表すボックス
pub(crate) fn vtta(notes: &str) -> Node {
    boxed(b"vtta", notes.as_bytes().to_vec(), vec![])
}

/// WebVTT のキューを表すボックス
pub(crate) fn vttc(
    payload: &str,
    current_time: Option<&str>,
    identifier: Option<&str>,
    settings: Option<&str>,
    source_id: Option<i32>,
) -> Node {
    let text_box = |ty: &[u8; 4], text: &str| boxed(ty, text.as_bytes().to_vec(), vec![]);
    let children: Vec<Node> = vec![
        source_id
            .map(|id| boxed(b"vsid", id.to_be_bytes().to_vec(), vec![]))
            .into(),
        identifier.map(|v| text_box(b"iden", v)).into(),
        current_time.map(|v| text_box(b"ctim", v)).into(),
        settings.map(|v| text_box(b"sttg", v)).into(),
        text_box(b"payl", payload),
    ];
    boxed(b"vttc", vec![], children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_box_sizes_are_patched() {
        let node = boxed(
            b"moov",
            vec![],
            vec![
                full_box(b"mvhd", 0, 0, vec![1, 2, 3], vec![]),
                Node::List(vec![Node::Bytes(vec![9; 5]), Node::from(None::<Node>)]),
            ],
        );
        assert_eq!(node.size(), 8 + 15 + 5);
        let bytes = node.to_bytes().unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 28, b'm', b'o', b'o', b'v']);
        assert_eq!(&bytes[8..16], &[0, 0, 0, 15, b'm', b'v', b'h', b'd']);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 0]);
    }

    #[test]
    fn large_size_header() {
        let node = Node::Box(BoxNode {
            box_type: *b"mdat",
            contents: vec![1, 2],
            children: vec![],
            large_size: true,
        });
        let bytes = node.to_bytes().unwrap();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[8..16], &18u64.to_be_bytes());
    }

    #[test]
    fn chunk_offsets_widen_to_co64() {
        let stco = chunk_offsets(&[8, 100]).to_bytes().unwrap();
        assert_eq!(&stco[4..8], b"stco");
        let co64 = chunk_offsets(&[8, 1 << 32]).to_bytes().unwrap();
        assert_eq!(&co64[4..8], b"co64");
        assert_eq!(co64.len(), 8 + 4 + 4 + 16);
    }

    #[test]
    fn ctts_version_depends_on_sign() {
        let positive = [CompositionOffsetEntry {
            sample_count: 1,
            sample_offset: 2,
        }];
        assert_eq!(ctts(&positive).to_bytes().unwrap()[8], 0);
        let negative = [CompositionOffsetEntry {
            sample_count: 1,
            sample_offset: -2,
        }];
        assert_eq!(ctts(&negative).to_bytes().unwrap()[8], 1);
        assert!(!needs_ctts(&[CompositionOffsetEntry {
            sample_count: 3,
            sample_offset: 0
        }]));
    }

    #[test]
    fn esds_descriptor_sizes() {
        let bytes = esds(0x40, Some(&[0x11, 0x90])).to_bytes().unwrap();
        // ES_Descriptor tag, size
        assert_eq!(&bytes[12..14], &[0x03, 25]);
        // DecoderConfigDescriptor tag, size, object type
        assert_eq!(&bytes[17..20], &[0x04, 17, 0x40]);
        assert_eq!(&bytes[bytes.len() - 3..], &[0x06, 0x01, 0x02]);
    }

    #[test]
    fn language_code_packing() {
        assert_eq!(language_code("und"), 0x55c4);
        assert_eq!(language_code("eng"), 0x15c7);
    }

    #[test]
    fn rotation_matrix_values() {
        assert_eq!(
            rotation_matrix(90),
            [0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn trun_flags_for_uniform_samples() {
        let samples = [
            FragmentSample {
                duration: 3000,
                size: 10,
                is_key: true,
                composition_offset: 0,
            },
            FragmentSample {
                duration: 3000,
                size: 10,
                is_key: false,
                composition_offset: 0,
            },
            FragmentSample {
                duration: 3000,
                size: 10,
                is_key: false,
                composition_offset: 0,
            },
        ];
        let bytes = trun(&samples, 100).to_bytes().unwrap();
        // first-sample-flags と data-offset のみ
        assert_eq!(&bytes[9..12], &[0x00, 0x00, 0x05]);
        assert_eq!(bytes.len(), 12 + 4 + 4 + 4);
    }

    #[test]
    fn trun_keeps_flags_of_later_key_samples() {
        let samples: Vec<FragmentSample> = [true, false, false, true, false]
            .into_iter()
            .map(|is_key| FragmentSample {
                duration: 3000,
                size: 10,
                is_key,
                composition_offset: 0,
            })
            .collect();
        let bytes = trun(&samples, 100).to_bytes().unwrap();
        // data-offset と sample-flags（first-sample-flags は使わない）
        assert_eq!(&bytes[9..12], &[0x00, 0x04, 0x01]);
        let flags: Vec<u32> = (0..5)
            .map(|i| {
                let pos = 20 + i * 4;
                u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap())
            })
            .collect();
        assert_eq!(
            flags,
            [true, false, false, true, false].map(fragment_sample_flags)
        );
    }

    #[test]
    fn mfro_contains_mfra_size() {
        let node = mfra(vec![tfra(
            1,
            &[RandomAccessEntry {
                time: 0,
                moof_offset: 24,
                traf_number: 1,
            }],
        )]);
        let bytes = node.to_bytes().unwrap();
        let size = bytes.len() as u32;
        assert_eq!(&bytes[bytes.len() - 4..], &size.to_be_bytes());
    }
}
