//! トラック、パケット、デコーダー設定などのマルチプレクサーへの入力を表す型
use crate::{Error, Result, codec::PcmFormat};

/// 映像コーデックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// H.264 / AVC
    Avc,

    /// H.265 / HEVC
    Hevc,

    /// VP8
    Vp8,

    /// VP9
    Vp9,

    /// AV1
    Av1,
}

impl VideoCodec {
    /// WebCodecs 形式のコーデック文字列からコーデックの種類を判定する
    pub fn from_codec_string(codec: &str) -> Result<Self> {
        if codec.starts_with("avc1.") || codec.starts_with("avc3.") {
            Ok(Self::Avc)
        } else if codec.starts_with("hev1.") || codec.starts_with("hvc1.") {
            Ok(Self::Hevc)
        } else if codec == "vp8" {
            Ok(Self::Vp8)
        } else if codec.starts_with("vp09.") {
            Ok(Self::Vp9)
        } else if codec.starts_with("av01.") {
            Ok(Self::Av1)
        } else {
            Err(Error::unsupported(format!(
                "Unknown video codec string: {codec:?}"
            )))
        }
    }

    /// コーデックの短い名前を返す
    pub const fn name(self) -> &'static str {
        match self {
            Self::Avc => "avc",
            Self::Hevc => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
        }
    }
}

/// 音声コーデックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    /// AAC
    Aac,

    /// Opus
    Opus,

    /// MP3
    Mp3,

    /// Vorbis
    Vorbis,

    /// FLAC
    Flac,

    /// 非圧縮 PCM（μ-law / A-law を含む）
    Pcm(PcmFormat),
}

impl AudioCodec {
    /// WebCodecs 形式のコーデック文字列からコーデックの種類を判定する
    pub fn from_codec_string(codec: &str) -> Result<Self> {
        match codec {
            "opus" => Ok(Self::Opus),
            "vorbis" => Ok(Self::Vorbis),
            "flac" => Ok(Self::Flac),
            "mp3" | "mp4a.69" | "mp4a.6B" | "mp4a.6b" => Ok(Self::Mp3),
            _ if codec.starts_with("mp4a.40.") || codec == "mp4a.40" => Ok(Self::Aac),
            _ if codec.starts_with("pcm-") || codec == "ulaw" || codec == "alaw" => {
                PcmFormat::from_codec_string(codec).map(Self::Pcm)
            }
            _ => Err(Error::unsupported(format!(
                "Unknown audio codec string: {codec:?}"
            ))),
        }
    }

    /// コーデックの短い名前を返す
    pub fn name(self) -> String {
        match self {
            Self::Aac => "aac".to_owned(),
            Self::Opus => "opus".to_owned(),
            Self::Mp3 => "mp3".to_owned(),
            Self::Vorbis => "vorbis".to_owned(),
            Self::Flac => "flac".to_owned(),
            Self::Pcm(format) => format.codec_string(),
        }
    }
}

/// 字幕コーデックの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubtitleCodec {
    /// WebVTT
    WebVtt,
}

/// メディアの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// 映像
    Video,

    /// 音声
    Audio,

    /// 字幕
    Subtitle,
}

/// トラックが扱うコーデック
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackCodec {
    /// 映像コーデック
    Video(VideoCodec),

    /// 音声コーデック
    Audio(AudioCodec),

    /// 字幕コーデック
    Subtitle(SubtitleCodec),
}

impl TrackCodec {
    /// コーデックに対応するメディアの種類を返す
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
            Self::Subtitle(_) => MediaKind::Subtitle,
        }
    }

    /// コーデックの短い名前を返す
    pub fn name(self) -> String {
        match self {
            Self::Video(c) => c.name().to_owned(),
            Self::Audio(c) => c.name(),
            Self::Subtitle(SubtitleCodec::WebVtt) => "webvtt".to_owned(),
        }
    }
}

/// 映像の回転角（時計回り）
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    /// 回転なし
    #[default]
    Deg0,

    /// 90 度
    Deg90,

    /// 180 度
    Deg180,

    /// 270 度
    Deg270,
}

impl Rotation {
    /// 度数から [`Rotation`] を生成する（0, 90, 180, 270 以外はエラー）
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees.rem_euclid(360) {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            _ => Err(Error::invalid_input(format!(
                "Rotation must be one of 0, 90, 180 or 270 degrees (got {degrees})"
            ))),
        }
    }

    /// 度数を返す
    pub const fn degrees(self) -> i32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// トラックの既定 / 強制表示フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackDisposition {
    /// 既定で選択されるトラックかどうか
    pub default: bool,

    /// 強制表示トラックかどうか
    pub forced: bool,
}

impl Default for TrackDisposition {
    fn default() -> Self {
        Self {
            default: true,
            forced: false,
        }
    }
}

/// トラックのメタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    /// ISO 639-2/T の 3 文字言語コード
    pub language: String,

    /// トラックの表示名
    pub name: Option<String>,

    /// 映像の回転角（映像トラックのみ有効）
    pub rotation: Rotation,

    /// 映像の想定フレームレート
    pub frame_rate: Option<f64>,

    /// トラックに追加されるパケット数の上限
    ///
    /// ISO 形式の [`FastStart::Reserve`](crate::mux::FastStart::Reserve) モードでは必須
    pub maximum_packet_count: Option<u64>,

    /// 既定 / 強制表示フラグ
    pub disposition: TrackDisposition,
}

impl TrackMetadata {
    /// 言語コードが未指定であることを表す値
    pub const UNDETERMINED_LANGUAGE: &'static str = "und";

    pub(crate) fn validate(&self) -> Result<()> {
        if self.language.len() != 3 || !self.language.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(Error::invalid_input(format!(
                "language must be a three-letter lowercase ISO 639-2 code (got {:?})",
                self.language
            )));
        }
        if let Some(frame_rate) = self.frame_rate
            && !(frame_rate.is_finite() && frame_rate > 0.0)
        {
            return Err(Error::invalid_input(format!(
                "frame_rate must be a positive finite number (got {frame_rate})"
            )));
        }
        if self.maximum_packet_count == Some(0) {
            return Err(Error::invalid_input(
                "maximum_packet_count must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for TrackMetadata {
    fn default() -> Self {
        Self {
            language: Self::UNDETERMINED_LANGUAGE.to_owned(),
            name: None,
            rotation: Rotation::Deg0,
            frame_rate: None,
            maximum_packet_count: None,
            disposition: TrackDisposition::default(),
        }
    }
}

/// パケットの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// 単独でデコード可能なキーパケット
    Key,

    /// 先行するパケットに依存するデルタパケット
    Delta,
}

/// パケットに付随するサイドデータ
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacketSideData {
    /// アルファチャンネル用の符号化データ
    pub alpha: Option<Vec<u8>>,
}

/// 符号化済みのパケット
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    /// 符号化データ
    pub data: Vec<u8>,

    /// パケット種別
    pub packet_type: PacketType,

    /// 表示タイムスタンプ（秒）
    pub timestamp: f64,

    /// 尺（秒）
    pub duration: f64,

    /// パケットのシーケンス番号
    pub sequence_number: i64,

    /// データのバイト数（メタデータのみのパケットでは `data` は空になる）
    pub byte_length: usize,

    /// サイドデータ
    pub side_data: PacketSideData,
}

impl EncodedPacket {
    /// [`EncodedPacket`] インスタンスを生成する
    pub fn new(data: Vec<u8>, packet_type: PacketType, timestamp: f64, duration: f64) -> Self {
        let byte_length = data.len();
        Self {
            data,
            packet_type,
            timestamp,
            duration,
            sequence_number: -1,
            byte_length,
            side_data: PacketSideData::default(),
        }
    }

    /// データを持たない、サイズ情報のみのパケットを生成する
    pub fn metadata_only(
        byte_length: usize,
        packet_type: PacketType,
        timestamp: f64,
        duration: f64,
    ) -> Self {
        Self {
            byte_length,
            ..Self::new(Vec::new(), packet_type, timestamp, duration)
        }
    }

    /// アルファチャンネル用のサイドデータを設定する
    pub fn with_alpha(mut self, alpha: Vec<u8>) -> Self {
        self.side_data.alpha = Some(alpha);
        self
    }

    /// シーケンス番号を設定する
    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// キーパケットかどうかを返す
    pub fn is_key(&self) -> bool {
        self.packet_type == PacketType::Key
    }

    /// メタデータのみのパケットかどうかを返す
    pub fn is_metadata_only(&self) -> bool {
        self.data.is_empty() && self.byte_length > 0
    }
}

/// 字幕キュー
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    /// キューの本文
    pub text: String,

    /// 表示開始タイムスタンプ（秒）
    pub timestamp: f64,

    /// 表示時間（秒）
    pub duration: f64,

    /// キュー識別子
    pub identifier: Option<String>,

    /// キュー設定（位置やサイズの指定など）
    pub settings: Option<String>,

    /// コメント
    pub notes: Option<String>,
}

impl SubtitleCue {
    /// [`SubtitleCue`] インスタンスを生成する
    pub fn new(text: impl Into<String>, timestamp: f64, duration: f64) -> Self {
        Self {
            text: text.into(),
            timestamp,
            duration,
            identifier: None,
            settings: None,
            notes: None,
        }
    }
}

/// 色の三原色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ColorPrimaries {
    Bt709,
    Bt470bg,
    Smpte170m,
    Bt2020,
    Smpte432,
}

impl ColorPrimaries {
    /// ISO/IEC 23091-4 のコード値を返す
    pub const fn code(self) -> u8 {
        match self {
            Self::Bt709 => 1,
            Self::Bt470bg => 5,
            Self::Smpte170m => 6,
            Self::Bt2020 => 9,
            Self::Smpte432 => 12,
        }
    }
}

/// 伝達特性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TransferCharacteristics {
    Bt709,
    Smpte170m,
    Linear,
    Iec61966_2_1,
    Pq,
    Hlg,
}

impl TransferCharacteristics {
    /// ISO/IEC 23091-4 のコード値を返す
    pub const fn code(self) -> u8 {
        match self {
            Self::Bt709 => 1,
            Self::Smpte170m => 6,
            Self::Linear => 8,
            Self::Iec61966_2_1 => 13,
            Self::Pq => 16,
            Self::Hlg => 18,
        }
    }
}

/// 行列係数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum MatrixCoefficients {
    Rgb,
    Bt709,
    Bt470bg,
    Smpte170m,
    Bt2020Ncl,
}

impl MatrixCoefficients {
    /// ISO/IEC 23091-4 のコード値を返す
    pub const fn code(self) -> u8 {
        match self {
            Self::Rgb => 0,
            Self::Bt709 => 1,
            Self::Bt470bg => 5,
            Self::Smpte170m => 6,
            Self::Bt2020Ncl => 9,
        }
    }
}

/// 映像の色空間
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub struct VideoColorSpace {
    pub primaries: Option<ColorPrimaries>,
    pub transfer: Option<TransferCharacteristics>,
    pub matrix: Option<MatrixCoefficients>,
    pub full_range: Option<bool>,
}

impl VideoColorSpace {
    /// 全ての項目が指定されているかどうか
    pub fn is_complete(&self) -> bool {
        self.primaries.is_some()
            && self.transfer.is_some()
            && self.matrix.is_some()
            && self.full_range.is_some()
    }
}

/// 映像トラックのデコーダー設定
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDecoderConfig {
    /// コーデックの種類（`codec_string` から判定される）
    pub codec: VideoCodec,

    /// WebCodecs 形式のコーデック文字列（例: `avc1.64001f`）
    pub codec_string: String,

    /// 符号化された映像の幅
    pub coded_width: u32,

    /// 符号化された映像の高さ
    pub coded_height: u32,

    /// デコーダー設定レコード（avcC / hvcC の中身など）
    ///
    /// AVC / HEVC で省略された場合は、パケットが Annex-B 形式であるとみなして最初のパケットから生成される
    pub description: Option<Vec<u8>>,

    /// 色空間
    pub color_space: Option<VideoColorSpace>,
}

impl VideoDecoderConfig {
    /// [`VideoDecoderConfig`] インスタンスを生成する
    pub fn new(codec_string: impl Into<String>, coded_width: u32, coded_height: u32) -> Result<Self> {
        let codec_string = codec_string.into();
        let codec = VideoCodec::from_codec_string(&codec_string)?;
        if coded_width == 0 || coded_height == 0 {
            return Err(Error::invalid_input(format!(
                "coded_width and coded_height must be positive (got {coded_width}x{coded_height})"
            )));
        }
        if coded_width > u16::MAX as u32 || coded_height > u16::MAX as u32 {
            return Err(Error::invalid_input(format!(
                "Video dimensions are too large: {coded_width}x{coded_height}"
            )));
        }
        Ok(Self {
            codec,
            codec_string,
            coded_width,
            coded_height,
            description: None,
            color_space: None,
        })
    }

    /// デコーダー設定レコードを設定する
    pub fn with_description(mut self, description: Vec<u8>) -> Self {
        self.description = Some(description);
        self
    }

    /// 色空間を設定する
    pub fn with_color_space(mut self, color_space: VideoColorSpace) -> Self {
        self.color_space = Some(color_space);
        self
    }
}

/// 音声トラックのデコーダー設定
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDecoderConfig {
    /// コーデックの種類（`codec_string` から判定される）
    pub codec: AudioCodec,

    /// WebCodecs 形式のコーデック文字列（例: `mp4a.40.2`, `opus`, `pcm-s16`）
    pub codec_string: String,

    /// サンプリングレート
    pub sample_rate: u32,

    /// チャンネル数
    pub number_of_channels: u32,

    /// コーデック固有の設定（AudioSpecificConfig / OpusHead / FLAC ヘッダなど）
    pub description: Option<Vec<u8>>,
}

impl AudioDecoderConfig {
    /// [`AudioDecoderConfig`] インスタンスを生成する
    pub fn new(
        codec_string: impl Into<String>,
        sample_rate: u32,
        number_of_channels: u32,
    ) -> Result<Self> {
        let codec_string = codec_string.into();
        let codec = AudioCodec::from_codec_string(&codec_string)?;
        if sample_rate == 0 {
            return Err(Error::invalid_input("sample_rate must be positive"));
        }
        if number_of_channels == 0 || number_of_channels > u8::MAX as u32 {
            return Err(Error::invalid_input(format!(
                "number_of_channels must be in 1..=255 (got {number_of_channels})"
            )));
        }
        Ok(Self {
            codec,
            codec_string,
            sample_rate,
            number_of_channels,
            description: None,
        })
    }

    /// コーデック固有の設定を設定する
    pub fn with_description(mut self, description: Vec<u8>) -> Self {
        self.description = Some(description);
        self
    }
}

/// 字幕トラックの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleConfig {
    /// WebVTT ファイルのヘッダ部分（`WEBVTT` 行から最初のキューの直前まで）
    pub description: String,
}

impl SubtitleConfig {
    /// [`SubtitleConfig`] インスタンスを生成する
    pub fn new(description: impl Into<String>) -> Result<Self> {
        let description = description.into();
        if !description.starts_with("WEBVTT") {
            return Err(Error::invalid_input(
                "WebVTT description must start with \"WEBVTT\"",
            ));
        }
        Ok(Self { description })
    }
}

/// 添付画像の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachedImageKind {
    /// 表紙
    CoverFront,

    /// 裏表紙
    CoverBack,

    /// その他
    Unknown,
}

/// メタデータとして埋め込まれる画像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    /// 画像データ
    pub data: Vec<u8>,

    /// MIME タイプ（例: `image/jpeg`）
    pub mime_type: String,

    /// 画像の種類
    pub kind: AttachedImageKind,

    /// ファイル名
    pub name: Option<String>,

    /// 説明
    pub description: Option<String>,
}

/// 任意のキーで追加するメタデータの値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTagValue {
    /// テキスト
    Text(String),

    /// バイナリ
    Binary(Vec<u8>),
}

/// ファイル全体に付与する説明的なメタデータ
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetadataTags {
    pub title: Option<String>,
    pub description: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,

    /// `YYYY-MM-DD` 形式の日付
    pub date: Option<String>,
    pub comment: Option<String>,
    pub images: Vec<AttachedImage>,

    /// コンテナ固有のキーで書き込まれる任意のタグ
    pub raw: Vec<(String, RawTagValue)>,
}

impl MetadataTags {
    /// タグが一つも設定されていないかどうか
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
