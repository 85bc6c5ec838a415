//! 出力ファイルの生成（トラック登録、パケット投入、完了処理）を行うモジュール
//!
//! [`Output`] が全ての公開操作の入り口となる。
//! 内部状態は一つの [`Mutex`] で保護されているため、複数のスレッドから同じ [`Output`] にパケットを投入できる。
//! 実際のコンテナの組み立ては形式ごとのマルチプレクサー（ISO BMFF / Matroska）が行う。
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    Error,
    codec::{
        OpusHead, PcmDataType, aac_audio_specific_config, extract_avc_decoder_configuration_record,
        extract_hevc_decoder_configuration_record,
    },
    metadata::{
        AudioCodec, AudioDecoderConfig, EncodedPacket, MediaKind, MetadataTags, SubtitleCodec,
        SubtitleConfig, SubtitleCue, TrackCodec, TrackMetadata, VideoCodec, VideoDecoderConfig,
    },
    sink::Target,
    writer::Writer,
};

mod isobmff;
mod matroska;
mod webvtt;

/// フラグメント / クラスターの最小尺のデフォルト値（秒）
pub const DEFAULT_MINIMUM_FRAGMENT_DURATION: f64 = 1.0;

/// Matroska の 1 ファイルに含められるトラック数の上限
pub const MATROSKA_MAX_TRACK_COUNT: usize = 127;

/// 書き込まれたボックス / 要素を受け取るコールバック
///
/// 引数は書き込まれたバイト列と、そのファイル先頭からの位置。
/// コールバックは出力の内部ロックを保持したまま呼ばれるので、同じ [`Output`] を操作してはいけない
pub type WriteCallback = Arc<dyn Fn(&[u8], u64) + Send + Sync>;

/// 書き込まれたフラグメント / クラスターを受け取るコールバック
///
/// [`WriteCallback`] の引数に加えて、その単位の先頭タイムスタンプ（秒）を受け取る
pub type FragmentCallback = Arc<dyn Fn(&[u8], u64, f64) + Send + Sync>;

/// ISO BMFF のインデックス (moov) の配置方法
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastStart {
    /// moov をファイル末尾に置く
    #[default]
    None,

    /// 全てのデータをメモリ上に保持し、完了時に moov をデータの前に置く
    InMemory,

    /// 各トラックの最大パケット数から moov の最大サイズを見積もって事前に領域を確保する
    Reserve,

    /// moof + mdat のフラグメント単位で書き出す (fMP4)
    Fragmented,
}

/// MP4 / MOV 出力用のオプション
#[derive(Clone)]
pub struct IsoOptions {
    /// moov の配置方法
    pub fast_start: FastStart,

    /// [`FastStart::Fragmented`] の場合のフラグメントの最小尺（秒）
    pub minimum_fragment_duration: f64,

    /// ftyp が書き込まれた時に呼ばれるコールバック
    pub on_ftyp: Option<WriteCallback>,

    /// moov が書き込まれた時に呼ばれるコールバック
    pub on_moov: Option<WriteCallback>,

    /// mdat が書き込まれた時に呼ばれるコールバック
    pub on_mdat: Option<WriteCallback>,

    /// moof が書き込まれた時に呼ばれるコールバック
    pub on_moof: Option<FragmentCallback>,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            fast_start: FastStart::None,
            minimum_fragment_duration: DEFAULT_MINIMUM_FRAGMENT_DURATION,
            on_ftyp: None,
            on_moov: None,
            on_mdat: None,
            on_moof: None,
        }
    }
}

impl core::fmt::Debug for IsoOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IsoOptions")
            .field("fast_start", &self.fast_start)
            .field("minimum_fragment_duration", &self.minimum_fragment_duration)
            .field("on_ftyp", &self.on_ftyp.is_some())
            .field("on_moov", &self.on_moov.is_some())
            .field("on_mdat", &self.on_mdat.is_some())
            .field("on_moof", &self.on_moof.is_some())
            .finish()
    }
}

/// MKV / WebM 出力用のオプション
#[derive(Clone)]
pub struct MatroskaOptions {
    /// 追記のみで書き出すかどうか
    ///
    /// 有効な場合はサイズ不明の要素を使い、書き込み済みの領域に戻らない（SeekHead と Duration は書かれない）
    pub append_only: bool,

    /// クラスターの最小尺（秒）
    pub minimum_cluster_duration: f64,

    /// EBML ヘッダが書き込まれた時に呼ばれるコールバック
    pub on_ebml_header: Option<WriteCallback>,

    /// Segment のヘッダ部分（Info, Tracks など）が書き込まれた時に呼ばれるコールバック
    pub on_segment_header: Option<WriteCallback>,

    /// クラスターが書き込まれた時に呼ばれるコールバック
    pub on_cluster: Option<FragmentCallback>,
}

impl Default for MatroskaOptions {
    fn default() -> Self {
        Self {
            append_only: false,
            minimum_cluster_duration: DEFAULT_MINIMUM_FRAGMENT_DURATION,
            on_ebml_header: None,
            on_segment_header: None,
            on_cluster: None,
        }
    }
}

impl core::fmt::Debug for MatroskaOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MatroskaOptions")
            .field("append_only", &self.append_only)
            .field("minimum_cluster_duration", &self.minimum_cluster_duration)
            .field("on_ebml_header", &self.on_ebml_header.is_some())
            .field("on_segment_header", &self.on_segment_header.is_some())
            .field("on_cluster", &self.on_cluster.is_some())
            .finish()
    }
}

/// 出力形式
#[derive(Debug, Clone)]
pub enum OutputFormat {
    /// MP4
    Mp4(IsoOptions),

    /// QuickTime (MOV)
    Mov(IsoOptions),

    /// Matroska (MKV)
    Mkv(MatroskaOptions),

    /// WebM
    WebM(MatroskaOptions),
}

impl OutputFormat {
    /// 形式の名前を返す
    pub fn name(&self) -> &'static str {
        self.container().name()
    }

    /// ファイル拡張子を返す
    pub fn file_extension(&self) -> &'static str {
        match self.container() {
            Container::Mp4 => ".mp4",
            Container::Mov => ".mov",
            Container::Mkv => ".mkv",
            Container::WebM => ".webm",
        }
    }

    fn container(&self) -> Container {
        match self {
            Self::Mp4(_) => Container::Mp4,
            Self::Mov(_) => Container::Mov,
            Self::Mkv(_) => Container::Mkv,
            Self::WebM(_) => Container::WebM,
        }
    }

    fn validate(&self) -> Result<(), MuxError> {
        let (field, value) = match self {
            Self::Mp4(o) | Self::Mov(o) => ("minimum_fragment_duration", o.minimum_fragment_duration),
            Self::Mkv(o) | Self::WebM(o) => ("minimum_cluster_duration", o.minimum_cluster_duration),
        };
        if !(value.is_finite() && value >= 0.0) {
            return Err(MuxError::validation(
                field,
                format!("must be a non-negative finite number (got {value})"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Mp4,
    Mov,
    Mkv,
    WebM,
}

impl Container {
    fn name(self) -> &'static str {
        match self {
            Self::Mp4 => "MP4",
            Self::Mov => "MOV",
            Self::Mkv => "MKV",
            Self::WebM => "WebM",
        }
    }

    fn supports(self, codec: TrackCodec) -> bool {
        match (self, codec) {
            (Self::WebM, TrackCodec::Video(c)) => {
                matches!(c, VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1)
            }
            (Self::WebM, TrackCodec::Audio(c)) => matches!(c, AudioCodec::Opus | AudioCodec::Vorbis),
            (Self::WebM, TrackCodec::Subtitle(_)) => true,
            (_, TrackCodec::Video(_)) => true,
            (Self::Mov, TrackCodec::Audio(_)) => true,
            (Self::Mov, TrackCodec::Subtitle(_)) => false,
            (Self::Mp4, TrackCodec::Audio(AudioCodec::Pcm(pcm))) => {
                matches!(pcm.data_type, PcmDataType::Signed | PcmDataType::Float)
                    && pcm.sample_size >= 2
            }
            (Self::Mkv, TrackCodec::Audio(AudioCodec::Pcm(pcm))) => match pcm.data_type {
                PcmDataType::Ulaw | PcmDataType::Alaw => false,
                PcmDataType::Float => pcm.little_endian,
                PcmDataType::Signed | PcmDataType::Unsigned => true,
            },
            (Self::Mp4 | Self::Mkv, TrackCodec::Audio(_)) => true,
            (Self::Mp4 | Self::Mkv, TrackCodec::Subtitle(_)) => true,
        }
    }

    fn max_track_count(self) -> usize {
        match self {
            Self::Mp4 | Self::Mov => u32::MAX as usize,
            Self::Mkv | Self::WebM => MATROSKA_MAX_TRACK_COUNT,
        }
    }

    /// `codec` を格納できる別の形式を探す
    fn suggest_for(self, codec: TrackCodec) -> Option<&'static str> {
        [Self::Mp4, Self::Mkv, Self::Mov, Self::WebM]
            .into_iter()
            .find(|&c| c != self && c.supports(codec))
            .map(Self::name)
    }
}

/// 出力の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputState {
    /// `start()` 前（トラックの登録が可能）
    Pending,

    /// `start()` 後（パケットの投入が可能）
    Started,

    /// 完了済み
    Finalized,

    /// 中断済み
    Canceled,

    /// 不変条件違反などの致命的なエラーにより中断された
    Failed,
}

/// 登録されたトラックを指すハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackHandle {
    id: u32,
    kind: MediaKind,
}

impl TrackHandle {
    /// トラック ID（登録順に 1 から振られる）を返す
    pub fn id(self) -> u32 {
        self.id
    }

    /// メディアの種類を返す
    pub fn kind(self) -> MediaKind {
        self.kind
    }
}

/// マルチプレックス処理のエラー
pub enum MuxError {
    /// 入力やオプションが無効
    Validation {
        /// 問題のある項目
        field: String,

        /// 理由
        reason: String,

        /// 代わりに使える形式などの提案
        suggestion: Option<String>,
    },

    /// 出力形式が対応していないコーデック
    UnsupportedCodec {
        /// 出力形式の名前
        format: &'static str,

        /// コーデック名
        codec: String,

        /// そのコーデックを格納できる別の形式
        suggestion: Option<&'static str>,
    },

    /// トラックの最初のパケットがキーパケットではない
    FirstPacketNotKey {
        /// トラック ID
        track_id: u32,
    },

    /// 直前の GOP の最大タイムスタンプより小さいタイムスタンプが渡された
    NonMonotonicTimestamp {
        /// トラック ID
        track_id: u32,

        /// 渡されたタイムスタンプ（秒）
        timestamp: f64,

        /// 直前の GOP までの最大タイムスタンプ（秒）
        max_timestamp: f64,
    },

    /// 負または有限でないタイムスタンプ
    NegativeTimestamp {
        /// トラック ID
        track_id: u32,

        /// 渡されたタイムスタンプ（秒）
        timestamp: f64,
    },

    /// [`FastStart::Reserve`] で宣言した最大パケット数を超えた
    ReservedPacketCountExceeded {
        /// トラック ID
        track_id: u32,

        /// 宣言された最大パケット数
        maximum: u64,
    },

    /// クラスター内の相対タイムスタンプが 16 ビットに収まらない
    ClusterTimestampOutOfRange {
        /// トラック ID
        track_id: u32,

        /// クラスター先頭からの相対タイムスタンプ（ミリ秒）
        relative_timestamp: i64,
    },

    /// 符号化データからのデコーダー設定の導出に失敗した
    ConfigExtraction(Error),

    /// バイト列の生成または書き込みに失敗した
    Encode(Error),

    /// 現在の状態では実行できない操作
    InvalidState {
        /// 操作名
        operation: &'static str,

        /// 現在の状態
        state: OutputState,
    },

    /// 出力は中断済み
    Canceled,

    /// 以前の `finalize()` 呼び出しが失敗した
    FinalizeFailed(String),
}

impl MuxError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
            suggestion: None,
        }
    }

    /// 出力を続行できない致命的なエラーかどうか
    ///
    /// 致命的なエラーが発生した出力は [`OutputState::Failed`] になり、それ以降の操作は受け付けない
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FirstPacketNotKey { .. }
                | Self::NonMonotonicTimestamp { .. }
                | Self::ReservedPacketCountExceeded { .. }
                | Self::ClusterTimestampOutOfRange { .. }
                | Self::Encode(_)
        )
    }
}

impl From<Error> for MuxError {
    fn from(error: Error) -> Self {
        Self::Encode(error)
    }
}

impl core::fmt::Display for MuxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Validation {
                field,
                reason,
                suggestion,
            } => {
                write!(f, "Invalid {field}: {reason}")?;
                if let Some(suggestion) = suggestion {
                    write!(f, " ({suggestion})")?;
                }
                Ok(())
            }
            Self::UnsupportedCodec {
                format,
                codec,
                suggestion,
            } => {
                write!(f, "Codec '{codec}' cannot be contained within {format}")?;
                if let Some(suggestion) = suggestion {
                    write!(f, "; use {suggestion} instead")?;
                }
                Ok(())
            }
            Self::FirstPacketNotKey { track_id } => {
                write!(f, "First packet of track #{track_id} must be a key packet")
            }
            Self::NonMonotonicTimestamp {
                track_id,
                timestamp,
                max_timestamp,
            } => write!(
                f,
                "Timestamps cannot be smaller than the largest timestamp of the previous GOP \
                 (track #{track_id}: got {timestamp}s, but largest timestamp is {max_timestamp}s)"
            ),
            Self::NegativeTimestamp {
                track_id,
                timestamp,
            } => write!(
                f,
                "Timestamps must be non-negative and finite (track #{track_id}: got {timestamp}s)"
            ),
            Self::ReservedPacketCountExceeded { track_id, maximum } => write!(
                f,
                "Track #{track_id} has already reached the maximum packet count ({maximum}); \
                 add less packets or increase maximum_packet_count"
            ),
            Self::ClusterTimestampOutOfRange {
                track_id,
                relative_timestamp,
            } => write!(
                f,
                "Block timestamp of track #{track_id} is {relative_timestamp}ms away from the cluster start, \
                 which does not fit in a signed 16-bit integer"
            ),
            Self::ConfigExtraction(e) => write!(f, "Failed to derive decoder configuration: {e}"),
            Self::Encode(e) => write!(f, "Failed to write output: {e}"),
            Self::InvalidState { operation, state } => {
                write!(f, "Cannot {operation} while the output is {state:?}")
            }
            Self::Canceled => write!(f, "Output has been canceled"),
            Self::FinalizeFailed(reason) => write!(f, "Finalization has already failed: {reason}"),
        }
    }
}

impl core::fmt::Debug for MuxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigExtraction(e) | Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

/// マルチプレクサーに渡されるトラック情報
#[derive(Debug, Clone)]
pub(crate) struct TrackInfo {
    pub id: u32,
    pub codec: TrackCodec,
    pub metadata: TrackMetadata,
}

/// 形式ごとのマルチプレクサー
///
/// 全てのメソッドは [`Output`] のロックを保持した状態で呼ばれる。
/// パケットのタイムスタンプは検証と正規化が済んだ状態で渡される
pub(crate) trait Muxer: Send {
    fn start(&mut self) -> Result<(), MuxError>;

    fn add_video_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<VideoDecoderConfig>,
    ) -> Result<(), MuxError>;

    fn add_audio_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<AudioDecoderConfig>,
    ) -> Result<(), MuxError>;

    fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        cue: SubtitleCue,
        config: Option<SubtitleConfig>,
    ) -> Result<(), MuxError>;

    fn close_track(&mut self, track_id: u32) -> Result<(), MuxError>;

    fn finalize(&mut self) -> Result<(), MuxError>;

    /// インデックスを書かずに出力を閉じて、破棄したサンプル数を返す
    fn cancel(&mut self) -> Result<usize, MuxError>;

    /// 全トラックのコーデック文字列（いずれかのトラックの設定が未確定なら `None`）
    fn codec_strings(&self) -> Option<Vec<(MediaKind, String)>>;

    fn take_buffer(&mut self) -> Option<Vec<u8>>;
}

/// GOP 単位のタイムスタンプの単調性を検査する
#[derive(Debug, Default, Clone, Copy)]
struct TimestampTracker {
    max_timestamp: Option<f64>,
    max_timestamp_before_last_key: f64,
}

impl TimestampTracker {
    fn validate(&mut self, track_id: u32, timestamp: f64, is_key: bool) -> Result<(), MuxError> {
        let max = match self.max_timestamp {
            Some(max) => max,
            None => {
                if !is_key {
                    return Err(MuxError::FirstPacketNotKey { track_id });
                }
                timestamp
            }
        };
        if !(timestamp.is_finite() && timestamp >= 0.0) {
            return Err(MuxError::NegativeTimestamp {
                track_id,
                timestamp,
            });
        }
        if is_key {
            self.max_timestamp_before_last_key = max;
        }
        if timestamp < self.max_timestamp_before_last_key {
            return Err(MuxError::NonMonotonicTimestamp {
                track_id,
                timestamp,
                max_timestamp: self.max_timestamp_before_last_key,
            });
        }
        self.max_timestamp = Some(max.max(timestamp));
        Ok(())
    }
}

#[derive(Debug)]
struct OutputTrack {
    info: TrackInfo,
    closed: bool,
    configured: bool,
    timestamps: TimestampTracker,
}

struct MuxerState {
    format: OutputFormat,
    target: Option<Target>,
    tracks: Vec<OutputTrack>,
    tags: MetadataTags,
    muxer: Option<Box<dyn Muxer>>,
    state: OutputState,
    finalize_outcome: Option<Result<(), String>>,
}

impl MuxerState {
    fn expect_state(&self, operation: &'static str, expected: OutputState) -> Result<(), MuxError> {
        match self.state {
            s if s == expected => Ok(()),
            OutputState::Canceled => Err(MuxError::Canceled),
            state => Err(MuxError::InvalidState { operation, state }),
        }
    }

    fn track_mut(&mut self, handle: TrackHandle) -> Result<&mut OutputTrack, MuxError> {
        self.tracks
            .get_mut(handle.id as usize - 1)
            .filter(|t| t.info.codec.kind() == handle.kind)
            .ok_or_else(|| {
                MuxError::validation("track", format!("Unknown track handle #{}", handle.id))
            })
    }

    fn register_track(
        &mut self,
        codec: TrackCodec,
        metadata: TrackMetadata,
    ) -> Result<TrackHandle, MuxError> {
        self.expect_state("add a track", OutputState::Pending)?;
        let container = self.format.container();
        if !container.supports(codec) {
            return Err(MuxError::UnsupportedCodec {
                format: container.name(),
                codec: codec.name(),
                suggestion: container.suggest_for(codec),
            });
        }
        if self.tracks.len() >= container.max_track_count() {
            return Err(MuxError::Validation {
                field: "tracks".to_owned(),
                reason: format!(
                    "{} supports at most {} tracks",
                    container.name(),
                    container.max_track_count()
                ),
                suggestion: None,
            });
        }
        metadata
            .validate()
            .map_err(|e| MuxError::validation("metadata", e.reason))?;

        let id = self.tracks.len() as u32 + 1;
        let kind = codec.kind();
        self.tracks.push(OutputTrack {
            info: TrackInfo {
                id,
                codec,
                metadata,
            },
            closed: false,
            configured: false,
            timestamps: TimestampTracker::default(),
        });
        tracing::debug!(track_id = id, codec = %codec.name(), "track added");
        Ok(TrackHandle { id, kind })
    }

    /// パケット投入前の共通検査を行う
    ///
    /// フレームレートが指定された映像トラックでは、タイムスタンプと尺をフレーム間隔の倍数に丸める
    fn admit_sample(
        &mut self,
        handle: TrackHandle,
        timestamp: &mut f64,
        duration: &mut f64,
        is_key: bool,
        has_config: bool,
    ) -> Result<(), MuxError> {
        self.expect_state("add a packet", OutputState::Started)?;
        let track = self.track_mut(handle)?;
        if track.closed {
            return Err(MuxError::validation(
                "track",
                format!("Track #{} has already been closed", handle.id),
            ));
        }
        if !track.configured && !has_config {
            return Err(MuxError::validation(
                "config",
                format!(
                    "A decoder configuration must be provided with the first packet of track #{}",
                    handle.id
                ),
            ));
        }
        if let Err(e) = track.timestamps.validate(handle.id, *timestamp, is_key) {
            if e.is_fatal() {
                tracing::warn!(error = %e, "output aborted");
                self.state = OutputState::Failed;
            }
            return Err(e);
        }
        track.configured = true;

        if let Some(frame_rate) = track.info.metadata.frame_rate
            && handle.kind == MediaKind::Video
        {
            *timestamp = round_to_multiple(*timestamp, 1.0 / frame_rate);
            *duration = round_to_multiple(*duration, 1.0 / frame_rate);
        }
        Ok(())
    }

    /// 致命的なエラーが返された場合は出力を失敗状態にする
    fn run<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Muxer) -> Result<T, MuxError>,
    ) -> Result<T, MuxError> {
        let Some(muxer) = self.muxer.as_deref_mut() else {
            return Err(MuxError::InvalidState {
                operation: "use the muxer",
                state: self.state,
            });
        };
        let result = f(muxer);
        if let Err(e) = &result
            && e.is_fatal()
        {
            tracing::warn!(error = %e, "output aborted");
            self.state = OutputState::Failed;
        }
        result
    }
}

/// マルチプレックス処理の出力
///
/// ```text
/// Output::new() -> add_*_track() -> start() -> add_*_packet() ... -> finalize()
/// ```
pub struct Output {
    inner: Mutex<MuxerState>,
}

impl Output {
    /// [`Output`] インスタンスを生成する
    pub fn new(format: OutputFormat, target: Target) -> Result<Self, MuxError> {
        format.validate()?;
        Ok(Self {
            inner: Mutex::new(MuxerState {
                format,
                target: Some(target),
                tracks: Vec::new(),
                tags: MetadataTags::default(),
                muxer: None,
                state: OutputState::Pending,
                finalize_outcome: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MuxerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 現在の状態を返す
    pub fn state(&self) -> OutputState {
        self.lock().state
    }

    /// 出力形式を返す
    pub fn format(&self) -> OutputFormat {
        self.lock().format.clone()
    }

    /// 映像トラックを追加する
    pub fn add_video_track(
        &self,
        codec: VideoCodec,
        metadata: TrackMetadata,
    ) -> Result<TrackHandle, MuxError> {
        self.lock().register_track(TrackCodec::Video(codec), metadata)
    }

    /// 音声トラックを追加する
    pub fn add_audio_track(
        &self,
        codec: AudioCodec,
        metadata: TrackMetadata,
    ) -> Result<TrackHandle, MuxError> {
        self.lock().register_track(TrackCodec::Audio(codec), metadata)
    }

    /// 字幕トラックを追加する
    pub fn add_subtitle_track(
        &self,
        codec: SubtitleCodec,
        metadata: TrackMetadata,
    ) -> Result<TrackHandle, MuxError> {
        self.lock()
            .register_track(TrackCodec::Subtitle(codec), metadata)
    }

    /// ファイル全体のメタデータを設定する（`start()` 前のみ）
    pub fn set_metadata_tags(&self, tags: MetadataTags) -> Result<(), MuxError> {
        let mut state = self.lock();
        state.expect_state("set metadata tags", OutputState::Pending)?;
        state.tags = tags;
        Ok(())
    }

    /// 出力を開始する
    ///
    /// これ以降はトラックの追加やメタデータの変更はできない
    pub fn start(&self) -> Result<(), MuxError> {
        let mut state = self.lock();
        state.expect_state("start", OutputState::Pending)?;
        if state.tracks.is_empty() {
            return Err(MuxError::validation(
                "tracks",
                "Output must have at least one track",
            ));
        }
        if let OutputFormat::Mp4(o) | OutputFormat::Mov(o) = &state.format
            && o.fast_start == FastStart::Reserve
            && let Some(t) = state
                .tracks
                .iter()
                .find(|t| t.info.metadata.maximum_packet_count.is_none())
        {
            return Err(MuxError::Validation {
                field: "maximum_packet_count".to_owned(),
                reason: format!(
                    "Track #{} must declare maximum_packet_count when using FastStart::Reserve",
                    t.info.id
                ),
                suggestion: Some("use FastStart::InMemory or FastStart::Fragmented".to_owned()),
            });
        }

        let target = state.target.take().ok_or(MuxError::InvalidState {
            operation: "start",
            state: state.state,
        })?;
        let writer = Writer::new(target.into_sink());
        let tracks: Vec<TrackInfo> = state.tracks.iter().map(|t| t.info.clone()).collect();
        let tags = core::mem::take(&mut state.tags);
        let mut muxer: Box<dyn Muxer> = match &state.format {
            OutputFormat::Mp4(o) => Box::new(isobmff::IsoMuxer::new(
                writer,
                tracks,
                tags,
                o.clone(),
                false,
            )),
            OutputFormat::Mov(o) => {
                Box::new(isobmff::IsoMuxer::new(writer, tracks, tags, o.clone(), true))
            }
            OutputFormat::Mkv(o) => Box::new(matroska::MatroskaMuxer::new(
                writer,
                tracks,
                tags,
                o.clone(),
                false,
            )),
            OutputFormat::WebM(o) => Box::new(matroska::MatroskaMuxer::new(
                writer,
                tracks,
                tags,
                o.clone(),
                true,
            )),
        };
        if let Err(e) = muxer.start() {
            state.state = OutputState::Failed;
            return Err(e);
        }
        state.muxer = Some(muxer);
        state.state = OutputState::Started;
        tracing::debug!(format = state.format.name(), tracks = state.tracks.len(), "output started");
        Ok(())
    }

    /// 映像パケットを追加する
    ///
    /// `config` はトラックの最初のパケットでは必須で、それ以降は無視される
    pub fn add_video_packet(
        &self,
        track: TrackHandle,
        mut packet: EncodedPacket,
        config: Option<VideoDecoderConfig>,
    ) -> Result<(), MuxError> {
        let mut state = self.lock();
        check_kind(track, MediaKind::Video)?;
        check_packet_data(&packet)?;
        if let Some(c) = &config {
            check_config_codec(&state, track, TrackCodec::Video(c.codec))?;
        }
        let is_key = packet.is_key();
        state.admit_sample(
            track,
            &mut packet.timestamp,
            &mut packet.duration,
            is_key,
            config.is_some(),
        )?;
        state.run(|m| m.add_video_packet(track.id, packet, config))
    }

    /// 音声パケットを追加する
    ///
    /// `config` はトラックの最初のパケットでは必須で、それ以降は無視される
    pub fn add_audio_packet(
        &self,
        track: TrackHandle,
        mut packet: EncodedPacket,
        config: Option<AudioDecoderConfig>,
    ) -> Result<(), MuxError> {
        let mut state = self.lock();
        check_kind(track, MediaKind::Audio)?;
        check_packet_data(&packet)?;
        if let Some(c) = &config {
            check_config_codec(&state, track, TrackCodec::Audio(c.codec))?;
        }
        let is_key = packet.is_key();
        state.admit_sample(
            track,
            &mut packet.timestamp,
            &mut packet.duration,
            is_key,
            config.is_some(),
        )?;
        state.run(|m| m.add_audio_packet(track.id, packet, config))
    }

    /// 字幕キューを追加する
    ///
    /// `config` はトラックの最初のキューでは必須で、それ以降は無視される
    pub fn add_subtitle_cue(
        &self,
        track: TrackHandle,
        mut cue: SubtitleCue,
        config: Option<SubtitleConfig>,
    ) -> Result<(), MuxError> {
        let mut state = self.lock();
        check_kind(track, MediaKind::Subtitle)?;
        if !(cue.duration.is_finite() && cue.duration >= 0.0) {
            return Err(MuxError::validation(
                "cue.duration",
                format!("must be a non-negative finite number (got {})", cue.duration),
            ));
        }
        state.admit_sample(
            track,
            &mut cue.timestamp,
            &mut cue.duration,
            true,
            config.is_some(),
        )?;
        state.run(|m| m.add_subtitle_cue(track.id, cue, config))
    }

    /// トラックを閉じる
    ///
    /// 閉じられたトラックは他のトラックのインターリーブを待たせなくなる
    pub fn close_track(&self, track: TrackHandle) -> Result<(), MuxError> {
        let mut state = self.lock();
        state.expect_state("close a track", OutputState::Started)?;
        let t = state.track_mut(track)?;
        if t.closed {
            return Ok(());
        }
        t.closed = true;
        tracing::debug!(track_id = track.id, "track closed");
        state.run(|m| m.close_track(track.id))
    }

    /// 出力を完了し、インデックスなどを書き込む
    ///
    /// 二回目以降の呼び出しは何も書き込まずに最初の呼び出しの結果を返す
    pub fn finalize(&self) -> Result<(), MuxError> {
        let mut state = self.lock();
        if let Some(outcome) = &state.finalize_outcome {
            return outcome.clone().map_err(MuxError::FinalizeFailed);
        }
        state.expect_state("finalize", OutputState::Started)?;

        let open: Vec<u32> = state
            .tracks
            .iter_mut()
            .filter(|t| !t.closed)
            .map(|t| {
                t.closed = true;
                t.info.id
            })
            .collect();
        let result = state.run(|m| {
            for id in open {
                m.close_track(id)?;
            }
            m.finalize()
        });
        match &result {
            Ok(()) => {
                state.state = OutputState::Finalized;
                state.finalize_outcome = Some(Ok(()));
                tracing::debug!("output finalized");
            }
            Err(e) => {
                state.state = OutputState::Failed;
                state.finalize_outcome = Some(Err(e.to_string()));
            }
        }
        result
    }

    /// 出力を中断する
    ///
    /// キューに残っているサンプルは破棄され、インデックスは書き込まれない（出力は再生可能なファイルにはならない）
    pub fn cancel(&self) -> Result<(), MuxError> {
        let mut state = self.lock();
        match state.state {
            OutputState::Finalized | OutputState::Canceled => return Ok(()),
            OutputState::Pending => {
                state.state = OutputState::Canceled;
                return Ok(());
            }
            OutputState::Started | OutputState::Failed => {}
        }
        for t in &mut state.tracks {
            t.closed = true;
        }
        state.state = OutputState::Canceled;
        let discarded = match state.muxer.as_deref_mut() {
            Some(muxer) => muxer.cancel()?,
            None => 0,
        };
        if discarded > 0 {
            tracing::warn!(discarded, "output canceled with queued samples");
        } else {
            tracing::debug!("output canceled");
        }
        Ok(())
    }

    /// 出力の MIME タイプを返す
    ///
    /// 全てのトラックのデコーダー設定が確定する（最初のパケットを受け取るか閉じられる）までは `None` を返す
    pub fn mime_type(&self) -> Option<String> {
        let state = self.lock();
        let codecs = state.muxer.as_deref()?.codec_strings()?;
        Some(build_mime_type(state.format.container(), &codecs))
    }

    /// メモリ上に生成されたファイルのバイト列を取り出す
    ///
    /// [`Target::Memory`] で完了済みの場合のみ `Some` を返す（一度だけ取り出せる）
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.state != OutputState::Finalized {
            return None;
        }
        state.muxer.as_deref_mut()?.take_buffer()
    }
}

impl core::fmt::Debug for Output {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("Output")
            .field("format", &state.format)
            .field("state", &state.state)
            .field("tracks", &state.tracks.len())
            .finish()
    }
}

fn check_kind(handle: TrackHandle, expected: MediaKind) -> Result<(), MuxError> {
    if handle.kind != expected {
        return Err(MuxError::validation(
            "track",
            format!(
                "Track #{} is a {:?} track, not a {expected:?} track",
                handle.id, handle.kind
            ),
        ));
    }
    Ok(())
}

fn check_packet_data(packet: &EncodedPacket) -> Result<(), MuxError> {
    if packet.is_metadata_only() {
        return Err(MuxError::validation(
            "packet.data",
            "Metadata-only packets cannot be written to a file",
        ));
    }
    if !(packet.duration.is_finite() && packet.duration >= 0.0) {
        return Err(MuxError::validation(
            "packet.duration",
            format!("must be a non-negative finite number (got {})", packet.duration),
        ));
    }
    Ok(())
}

fn check_config_codec(
    state: &MuxerState,
    handle: TrackHandle,
    codec: TrackCodec,
) -> Result<(), MuxError> {
    let Some(track) = state.tracks.get(handle.id as usize - 1) else {
        return Ok(());
    };
    if track.info.codec != codec {
        return Err(MuxError::validation(
            "config.codec_string",
            format!(
                "Track #{} was registered as {}, but the configuration is for {}",
                handle.id,
                track.info.codec.name(),
                codec.name()
            ),
        ));
    }
    Ok(())
}

fn build_mime_type(container: Container, codecs: &[(MediaKind, String)]) -> String {
    let has = |kind| codecs.iter().any(|(k, _)| *k == kind);
    let base = if has(MediaKind::Video) {
        "video"
    } else if has(MediaKind::Audio) {
        "audio"
    } else {
        "application"
    };
    let subtype = match container {
        Container::Mp4 => "mp4",
        Container::Mov => "quicktime",
        Container::Mkv => "x-matroska",
        Container::WebM => "webm",
    };
    let mut unique: Vec<&str> = Vec::new();
    for (_, codec) in codecs {
        if !unique.contains(&codec.as_str()) {
            unique.push(codec);
        }
    }
    if unique.is_empty() {
        format!("{base}/{subtype}")
    } else {
        format!("{base}/{subtype}; codecs=\"{}\"", unique.join(", "))
    }
}

/// 秒を `timescale` 単位の整数に変換する
pub(crate) fn into_timescale(seconds: f64, timescale: u32) -> u64 {
    (seconds * timescale as f64).round().max(0.0) as u64
}

pub(crate) fn round_to_multiple(value: f64, multiple: f64) -> f64 {
    (value / multiple).round() * multiple
}

/// AVC / HEVC で description が省略されている場合に、Annex-B 形式の最初のパケットから生成する
///
/// 戻り値の二番目は、以降のパケットを長さプレフィックス形式に変換する必要があるかどうか
pub(crate) fn resolve_video_config(
    mut config: VideoDecoderConfig,
    first_packet: &[u8],
) -> Result<(VideoDecoderConfig, bool), MuxError> {
    if config.description.is_some() {
        return Ok((config, false));
    }
    let description = match config.codec {
        VideoCodec::Avc => extract_avc_decoder_configuration_record(first_packet)
            .and_then(|r| r.to_bytes())
            .map_err(MuxError::ConfigExtraction)?,
        VideoCodec::Hevc => extract_hevc_decoder_configuration_record(first_packet)
            .and_then(|r| r.to_bytes())
            .map_err(MuxError::ConfigExtraction)?,
        VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1 => return Ok((config, false)),
    };
    config.description = Some(description);
    Ok((config, true))
}

/// コンテナに書き込む音声のコーデック固有設定を決める
///
/// AAC と Opus は省略時に既定値から生成する。Vorbis と FLAC は省略できない
pub(crate) fn resolve_audio_description(
    config: &AudioDecoderConfig,
) -> Result<Option<Vec<u8>>, MuxError> {
    if let Some(description) = &config.description {
        return Ok(Some(description.clone()));
    }
    match config.codec {
        AudioCodec::Aac => aac_audio_specific_config(
            &config.codec_string,
            config.sample_rate,
            config.number_of_channels,
        )
        .map(Some)
        .map_err(MuxError::ConfigExtraction),
        AudioCodec::Opus => Ok(Some(
            OpusHead::with_defaults(config.number_of_channels as u8, config.sample_rate).to_bytes(),
        )),
        AudioCodec::Vorbis | AudioCodec::Flac => Err(MuxError::validation(
            "config.description",
            format!(
                "A description is required for {} tracks",
                config.codec.name()
            ),
        )),
        AudioCodec::Mp3 | AudioCodec::Pcm(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmFormat;

    #[test]
    fn timestamp_tracker_rules() {
        let mut t = TimestampTracker::default();
        assert!(matches!(
            t.validate(1, 0.0, false),
            Err(MuxError::FirstPacketNotKey { track_id: 1 })
        ));
        t.validate(1, 0.0, true).unwrap();
        // GOP 内の並べ替えは許される
        t.validate(1, 0.2, false).unwrap();
        t.validate(1, 0.1, false).unwrap();
        t.validate(1, 0.3, true).unwrap();
        assert!(matches!(
            t.validate(1, 0.15, false),
            Err(MuxError::NonMonotonicTimestamp { .. })
        ));
        assert!(matches!(
            t.validate(1, -1.0, true),
            Err(MuxError::NegativeTimestamp { .. })
        ));
        assert!(matches!(
            t.validate(1, f64::NAN, true),
            Err(MuxError::NegativeTimestamp { .. })
        ));
    }

    #[test]
    fn container_codec_support() {
        let opus = TrackCodec::Audio(AudioCodec::Opus);
        let aac = TrackCodec::Audio(AudioCodec::Aac);
        let avc = TrackCodec::Video(VideoCodec::Avc);
        let ulaw = TrackCodec::Audio(AudioCodec::Pcm(
            PcmFormat::from_codec_string("ulaw").unwrap(),
        ));
        let f32be = TrackCodec::Audio(AudioCodec::Pcm(
            PcmFormat::from_codec_string("pcm-f32be").unwrap(),
        ));
        let vtt = TrackCodec::Subtitle(crate::metadata::SubtitleCodec::WebVtt);

        assert!(Container::WebM.supports(opus));
        assert!(!Container::WebM.supports(aac));
        assert!(!Container::WebM.supports(avc));
        assert_eq!(Container::WebM.suggest_for(avc), Some("MP4"));
        assert!(Container::Mov.supports(ulaw));
        assert!(!Container::Mp4.supports(ulaw));
        assert!(!Container::Mkv.supports(ulaw));
        assert!(!Container::Mkv.supports(f32be));
        assert!(Container::Mp4.supports(f32be));
        assert!(!Container::Mov.supports(vtt));
        assert_eq!(Container::Mov.suggest_for(vtt), Some("MP4"));
    }

    #[test]
    fn mime_types() {
        let codecs = vec![
            (MediaKind::Video, "avc1.42001f".to_owned()),
            (MediaKind::Audio, "mp4a.40.2".to_owned()),
            (MediaKind::Audio, "mp4a.40.2".to_owned()),
        ];
        assert_eq!(
            build_mime_type(Container::Mp4, &codecs),
            "video/mp4; codecs=\"avc1.42001f, mp4a.40.2\""
        );
        let codecs = vec![(MediaKind::Audio, "opus".to_owned())];
        assert_eq!(
            build_mime_type(Container::WebM, &codecs),
            "audio/webm; codecs=\"opus\""
        );
        assert_eq!(build_mime_type(Container::Mkv, &[]), "application/x-matroska");
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(into_timescale(1.0 / 30.0, 30), 1);
        assert_eq!(into_timescale(0.5, 48000), 24000);
        assert!((round_to_multiple(0.034, 1.0 / 30.0) - 1.0 / 30.0).abs() < 1e-12);
    }
}
