//! EBML (Matroska / WebM) の要素ツリーとその書き込み処理
use std::collections::HashMap;

use crate::{Error, Result, sink::MemorySink, writer::Writer};

/// Matroska の要素 ID
#[allow(missing_docs)]
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_DEFAULT: u32 = 0x88;
    pub const FLAG_FORCED: u32 = 0x55AA;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const NAME: u32 = 0x536E;
    pub const LANGUAGE: u32 = 0x22_B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const CODEC_DELAY: u32 = 0x56AA;
    pub const SEEK_PRE_ROLL: u32 = 0x56BB;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;

    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const ALPHA_MODE: u32 = 0x53C0;
    pub const COLOUR: u32 = 0x55B0;
    pub const MATRIX_COEFFICIENTS: u32 = 0x55B1;
    pub const RANGE: u32 = 0x55B9;
    pub const TRANSFER_CHARACTERISTICS: u32 = 0x55BA;
    pub const PRIMARIES: u32 = 0x55BB;
    pub const PROJECTION: u32 = 0x7670;
    pub const PROJECTION_TYPE: u32 = 0x7671;
    pub const PROJECTION_POSE_ROLL: u32 = 0x7675;

    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const TAGS: u32 = 0x1254_C367;
    pub const TAG: u32 = 0x7373;
    pub const TARGETS: u32 = 0x63C0;
    pub const TARGET_TYPE_VALUE: u32 = 0x68CA;
    pub const TARGET_TYPE: u32 = 0x63CA;
    pub const SIMPLE_TAG: u32 = 0x67C8;
    pub const TAG_NAME: u32 = 0x45A3;
    pub const TAG_STRING: u32 = 0x4487;
    pub const TAG_BINARY: u32 = 0x4485;

    pub const ATTACHMENTS: u32 = 0x1941_A469;
    pub const ATTACHED_FILE: u32 = 0x61A7;
    pub const FILE_DESCRIPTION: u32 = 0x467E;
    pub const FILE_NAME: u32 = 0x466E;
    pub const FILE_MEDIA_TYPE: u32 = 0x4660;
    pub const FILE_DATA: u32 = 0x465C;
    pub const FILE_UID: u32 = 0x46AE;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADD_ID: u32 = 0xEE;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

/// 書き込み時に位置を記録しておく要素の目印
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Mark {
    Segment,
    SeekHead,
    Info,
    Duration,
    Tracks,
    Tags,
    Attachments,
    Cues,
    Cluster,
}

/// 要素のサイズフィールドの指定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    /// サイズ不明（`0xFF`）
    Unknown,

    /// サイズフィールドのバイト数（整数要素では値のバイト数も兼ねる）
    Width(u8),
}

/// 要素の値
#[derive(Debug, Clone, PartialEq)]
pub enum EbmlData {
    /// バイナリ
    Bytes(Vec<u8>),

    /// 子要素（マスター要素）
    Children(Vec<EbmlNode>),

    /// 符号なし整数
    Uint(u64),

    /// 符号付き整数
    Int(i64),

    /// 32 ビット浮動小数点数
    Float32(f32),

    /// 64 ビット浮動小数点数
    Float64(f64),

    /// UTF-8 文字列
    String(String),
}

/// EBML 要素
#[derive(Debug, Clone, PartialEq)]
pub struct Ebml {
    /// 要素 ID（マーカービットを含む）
    pub id: u32,

    /// サイズフィールドの指定（`None` の場合は自動で決まる）
    pub size: Option<ElementSize>,

    /// 値
    pub data: EbmlData,

    /// 書き込み位置を記録するための目印
    pub mark: Option<Mark>,
}

impl Ebml {
    fn new(id: u32, data: EbmlData) -> Self {
        Self {
            id,
            size: None,
            data,
            mark: None,
        }
    }

    /// 符号なし整数要素を生成する
    pub fn uint(id: u32, value: u64) -> Self {
        Self::new(id, EbmlData::Uint(value))
    }

    /// 符号付き整数要素を生成する
    pub fn int(id: u32, value: i64) -> Self {
        Self::new(id, EbmlData::Int(value))
    }

    /// マスター要素を生成する
    pub fn master(id: u32, children: Vec<EbmlNode>) -> Self {
        Self::new(id, EbmlData::Children(children))
    }

    /// バイナリ要素を生成する
    pub fn bytes(id: u32, bytes: Vec<u8>) -> Self {
        Self::new(id, EbmlData::Bytes(bytes))
    }

    /// 文字列要素を生成する
    pub fn string(id: u32, value: impl Into<String>) -> Self {
        Self::new(id, EbmlData::String(value.into()))
    }

    /// 32 ビット浮動小数点数要素を生成する
    pub fn float32(id: u32, value: f32) -> Self {
        Self::new(id, EbmlData::Float32(value))
    }

    /// 64 ビット浮動小数点数要素を生成する
    pub fn float64(id: u32, value: f64) -> Self {
        Self::new(id, EbmlData::Float64(value))
    }

    /// サイズフィールドの指定を設定する
    pub fn with_size(mut self, size: ElementSize) -> Self {
        self.size = Some(size);
        self
    }

    /// 目印を設定する
    pub fn with_mark(mut self, mark: Mark) -> Self {
        self.mark = Some(mark);
        self
    }
}

/// 要素ツリーのノード
#[derive(Debug, Clone, PartialEq)]
pub enum EbmlNode {
    /// そのまま書き込まれるバイト列
    Raw(Vec<u8>),

    /// 順に書き込まれるノード列
    List(Vec<EbmlNode>),

    /// 要素
    Element(Ebml),
}

impl From<Ebml> for EbmlNode {
    fn from(e: Ebml) -> Self {
        Self::Element(e)
    }
}

impl From<Option<Ebml>> for EbmlNode {
    fn from(e: Option<Ebml>) -> Self {
        e.map_or(Self::List(Vec::new()), Self::Element)
    }
}

/// 可変長整数 (VINT) として `value` を表現するのに必要なバイト数
///
/// 全ビットが 1 のパターンは「サイズ不明」のために予約されているので避ける
pub fn measure_var_int(value: u64) -> u8 {
    (1..=8u8)
        .find(|&w| value < (1u64 << (7 * w as u32)) - 1)
        .unwrap_or(8)
}

/// 符号なし整数を表現するのに必要なバイト数（0 は 1 バイト）
pub fn measure_unsigned_int(value: u64) -> u8 {
    (1..=8u8)
        .find(|&w| w == 8 || value < 1u64 << (8 * w as u32))
        .unwrap_or(8)
}

/// 2 の補数の符号付き整数を表現するのに必要なバイト数
pub fn measure_signed_int(value: i64) -> u8 {
    (1..=8u8)
        .find(|&w| {
            w == 8 || {
                let limit = 1i64 << (8 * w as u32 - 1);
                -limit <= value && value < limit
            }
        })
        .unwrap_or(8)
}

/// 要素ツリーを書き込み、目印つき要素の位置を記録するライター
#[derive(Debug, Default)]
pub struct EbmlWriter {
    offsets: HashMap<Mark, u64>,
    data_offsets: HashMap<Mark, u64>,
}

impl EbmlWriter {
    /// [`EbmlWriter`] インスタンスを生成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 目印つき要素の先頭（要素 ID の位置）を返す
    pub fn offset(&self, mark: Mark) -> Option<u64> {
        self.offsets.get(&mark).copied()
    }

    /// 目印つきマスター要素の子要素の開始位置を返す
    pub fn data_offset(&self, mark: Mark) -> Option<u64> {
        self.data_offsets.get(&mark).copied()
    }

    /// ノードを書き込む
    pub fn write(&mut self, writer: &mut Writer, node: &EbmlNode) -> Result<()> {
        match node {
            EbmlNode::Raw(bytes) => writer.write(bytes),
            EbmlNode::List(nodes) => {
                for node in nodes {
                    self.write(writer, node)?;
                }
                Ok(())
            }
            EbmlNode::Element(element) => self.write_element(writer, element),
        }
    }

    fn write_element(&mut self, writer: &mut Writer, e: &Ebml) -> Result<()> {
        if let Some(mark) = e.mark {
            self.offsets.insert(mark, writer.pos());
        }
        write_id(writer, e.id)?;

        let explicit_width = match e.size {
            Some(ElementSize::Width(w)) => {
                if !(1..=8).contains(&w) {
                    return Err(Error::invalid_input(format!(
                        "Invalid EBML size width: {w}"
                    )));
                }
                Some(w)
            }
            _ => None,
        };

        match &e.data {
            EbmlData::Children(children) => {
                let unknown = e.size == Some(ElementSize::Unknown);
                let size_pos = writer.pos();
                let width = explicit_width.unwrap_or(4);
                if unknown {
                    writer.write_u8(0xFF)?;
                } else {
                    writer.write(&[0; 8][..width as usize])?;
                }
                let start = writer.pos();
                if let Some(mark) = e.mark {
                    self.data_offsets.insert(mark, start);
                }
                for child in children {
                    self.write(writer, child)?;
                }
                if !unknown {
                    let end = writer.pos();
                    writer.seek(size_pos);
                    write_var_int(writer, end - start, width)?;
                    writer.seek(end);
                }
                Ok(())
            }
            EbmlData::Uint(value) => {
                let width = explicit_width.unwrap_or_else(|| measure_unsigned_int(*value));
                if width < 8 && *value >= 1u64 << (8 * width as u32) {
                    return Err(Error::invalid_input(format!(
                        "Value {value} does not fit in {width} bytes"
                    )));
                }
                write_var_int(writer, width as u64, measure_var_int(width as u64))?;
                writer.write(&value.to_be_bytes()[8 - width as usize..])
            }
            EbmlData::Int(value) => {
                let width = explicit_width.unwrap_or_else(|| measure_signed_int(*value));
                write_var_int(writer, width as u64, 1)?;
                writer.write(&value.to_be_bytes()[8 - width as usize..])
            }
            EbmlData::Float32(value) => {
                write_var_int(writer, 4, 1)?;
                writer.write(&value.to_be_bytes())
            }
            EbmlData::Float64(value) => {
                write_var_int(writer, 8, 1)?;
                writer.write(&value.to_be_bytes())
            }
            EbmlData::String(value) => {
                let len = value.len() as u64;
                write_var_int(writer, len, explicit_width.unwrap_or(measure_var_int(len)))?;
                writer.write(value.as_bytes())
            }
            EbmlData::Bytes(bytes) => {
                let len = bytes.len() as u64;
                write_var_int(writer, len, explicit_width.unwrap_or(measure_var_int(len)))?;
                writer.write(bytes)
            }
        }
    }
}

/// 要素 ID を書き込む（ID はマーカービットを含んだ値なので最小バイト数でそのまま書く）
fn write_id(writer: &mut Writer, id: u32) -> Result<()> {
    let bytes = id.to_be_bytes();
    let skip = match id {
        0..=0xFF => 3,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 1,
        _ => 0,
    };
    writer.write(&bytes[skip..])
}

/// `value` を `width` バイトの可変長整数 (VINT) として書き込む
pub fn write_var_int(writer: &mut Writer, value: u64, width: u8) -> Result<()> {
    if !(1..=8).contains(&width) || value >= (1u64 << (7 * width as u32)) {
        return Err(Error::invalid_input(format!(
            "Value {value} cannot be encoded as a {width}-byte EBML variable-length integer"
        )));
    }
    let encoded = value | (1u64 << (7 * width as u32));
    writer.write(&encoded.to_be_bytes()[8 - width as usize..])
}

impl EbmlNode {
    /// ノードをバイト列に変換する
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Box::new(MemorySink::new()));
        EbmlWriter::new().write(&mut writer, self)?;
        writer.finalize()?;
        writer
            .take_buffer()
            .ok_or_else(|| Error::internal("Memory sink did not return its buffer"))
    }
}
