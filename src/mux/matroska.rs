//! MKV / WebM 形式のマルチプレクサー
use std::collections::VecDeque;

use super::{
    MatroskaOptions, MuxError, Muxer, TrackInfo, resolve_audio_description, resolve_video_config,
    webvtt::rebase_inline_timestamps,
};
use crate::{
    Error,
    codec::{
        PcmDataType, VpCodecConfig, annex_b_to_length_prefixed, av1_config_from_codec_string,
        fix_vp9_color_space, parse_opus_head,
    },
    ebml::{Ebml, EbmlNode, EbmlWriter, ElementSize, Mark, ids, write_var_int},
    metadata::{
        AttachedImage, AttachedImageKind, AudioCodec, AudioDecoderConfig, EncodedPacket,
        MediaKind, MetadataTags, RawTagValue, SubtitleConfig, SubtitleCue, VideoCodec,
        VideoColorSpace, VideoDecoderConfig,
    },
    writer::Writer,
};

/// 1 タイムスタンプ単位 = 1 ミリ秒
const TIMESTAMP_SCALE: u64 = 1_000_000;

const SEGMENT_SIZE_WIDTH: u8 = 6;
const CLUSTER_SIZE_WIDTH: u8 = 8;
const SEEK_POSITION_WIDTH: u8 = 5;

const OPUS_SEEK_PRE_ROLL_NS: u64 = 80_000_000;

const APP_NAME: &str = concat!("shiguredo_mux ", env!("CARGO_PKG_VERSION"));

#[derive(Debug)]
enum TrackConfig {
    Video {
        config: VideoDecoderConfig,
        length_prefix: bool,
        has_alpha: bool,
        color_fixed: bool,
    },
    Audio {
        config: AudioDecoderConfig,
    },
    Subtitle {
        config: SubtitleConfig,
    },
}

#[derive(Debug)]
struct Block {
    timestamp: f64,
    duration: f64,
    data: Vec<u8>,
    is_key: bool,
    additions: Option<Vec<u8>>,
}

#[derive(Debug)]
struct MkvTrack {
    info: TrackInfo,
    config: TrackConfig,
    queue: VecDeque<Block>,
    last_written_ms: Option<i64>,
}

impl MkvTrack {
    fn codec_string(&self) -> String {
        match &self.config {
            TrackConfig::Video { config, .. } => config.codec_string.clone(),
            TrackConfig::Audio { config } => config.codec_string.clone(),
            TrackConfig::Subtitle { .. } => "wvtt".to_owned(),
        }
    }
}

#[derive(Debug)]
struct Cluster {
    timestamp_ms: i64,
    max_written_ms: i64,
    offset: u64,
    data_offset: u64,

    /// クラスター内で最初に書かれたブロックのタイムスタンプ（トラック ID ごと）
    first_timestamps: Vec<(u32, i64)>,
}

#[derive(Debug)]
struct CuePoint {
    time_ms: i64,
    positions: Vec<(u32, u64)>,
}

pub(crate) struct MatroskaMuxer {
    writer: Writer,
    ebml: EbmlWriter,
    options: MatroskaOptions,
    webm: bool,
    infos: Vec<TrackInfo>,
    closed: Vec<bool>,
    tags: MetadataTags,

    /// ブロックを受け取ったトラック（ID 順）
    tracks: Vec<MkvTrack>,
    segment_created: bool,
    cluster: Option<Cluster>,
    cue_points: Vec<CuePoint>,
    duration_ms: i64,
}

impl MatroskaMuxer {
    pub fn new(
        writer: Writer,
        infos: Vec<TrackInfo>,
        tags: MetadataTags,
        options: MatroskaOptions,
        webm: bool,
    ) -> Self {
        Self {
            writer,
            ebml: EbmlWriter::new(),
            options,
            webm,
            closed: vec![false; infos.len()],
            infos,
            tags,
            tracks: Vec::new(),
            segment_created: false,
            cluster: None,
            cue_points: Vec::new(),
            duration_ms: 0,
        }
    }

    fn track_index(&self, id: u32) -> Option<usize> {
        self.tracks.iter().position(|t| t.info.id == id)
    }

    fn is_closed(&self, id: u32) -> bool {
        self.closed.get(id as usize - 1).copied().unwrap_or(true)
    }

    fn all_tracks_known(&self) -> bool {
        self.infos
            .iter()
            .all(|i| self.is_closed(i.id) || self.track_index(i.id).is_some())
    }

    fn info(&self, id: u32) -> Result<TrackInfo, MuxError> {
        self.infos
            .get(id as usize - 1)
            .cloned()
            .ok_or_else(|| Error::internal(format!("Unknown track #{id}")).into())
    }

    fn insert_track(&mut self, info: TrackInfo, config: TrackConfig) -> usize {
        let id = info.id;
        tracing::debug!(track_id = id, "track configured");
        self.tracks.push(MkvTrack {
            info,
            config,
            queue: VecDeque::new(),
            last_written_ms: None,
        });
        self.tracks.sort_by_key(|t| t.info.id);
        self.tracks.iter().position(|t| t.info.id == id).unwrap_or(0)
    }

    fn write_node(&mut self, node: impl Into<EbmlNode>) -> Result<(), MuxError> {
        self.ebml.write(&mut self.writer, &node.into())?;
        Ok(())
    }

    /// セグメントの子要素の開始位置からの相対位置
    fn segment_relative(&self, mark: Mark) -> u64 {
        match (self.ebml.offset(mark), self.ebml.data_offset(Mark::Segment)) {
            (Some(offset), Some(base)) => offset.saturating_sub(base),
            _ => 0,
        }
    }

    fn has_attachments(&self) -> bool {
        !self.tags.images.is_empty()
    }

    /// EBML ヘッダー、セグメントヘッダー、トラック情報などを書き込む
    fn create_segment(&mut self) -> Result<(), MuxError> {
        let append_only = self.options.append_only;
        let doc_type = if self.webm { "webm" } else { "matroska" };
        let header = Ebml::master(
            ids::EBML,
            vec![
                Ebml::uint(ids::EBML_VERSION, 1).into(),
                Ebml::uint(ids::EBML_READ_VERSION, 1).into(),
                Ebml::uint(ids::EBML_MAX_ID_LENGTH, 4).into(),
                Ebml::uint(ids::EBML_MAX_SIZE_LENGTH, 8).into(),
                Ebml::string(ids::DOC_TYPE, doc_type).into(),
                Ebml::uint(ids::DOC_TYPE_VERSION, 2).into(),
                Ebml::uint(ids::DOC_TYPE_READ_VERSION, 2).into(),
            ],
        );
        let on_ebml_header = self.options.on_ebml_header.clone();
        if on_ebml_header.is_some() {
            self.writer.start_tracking_writes();
        }
        self.write_node(header)?;
        if let Some(callback) = on_ebml_header {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }

        let on_segment_header = self.options.on_segment_header.clone();
        if on_segment_header.is_some() {
            self.writer.start_tracking_writes();
        }
        let segment_size = if append_only {
            ElementSize::Unknown
        } else {
            ElementSize::Width(SEGMENT_SIZE_WIDTH)
        };
        self.write_node(
            Ebml::master(ids::SEGMENT, vec![])
                .with_size(segment_size)
                .with_mark(Mark::Segment),
        )?;
        if !append_only {
            let seek_head = self.seek_head();
            self.write_node(seek_head)?;
        }
        let info = self.info_element();
        self.write_node(info)?;
        let tracks = self.tracks_element()?;
        self.write_node(tracks)?;
        let tags = self.tags_element();
        self.write_node(tags)?;
        let attachments = self.attachments_element();
        self.write_node(attachments)?;
        if let Some(callback) = on_segment_header {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }

        self.segment_created = true;
        tracing::debug!(doc_type, tracks = self.tracks.len(), "segment header written");
        self.writer.flush()?;
        Ok(())
    }

    fn seek_head(&self) -> Ebml {
        let seek = |id: u32, mark: Mark| -> EbmlNode {
            Ebml::master(
                ids::SEEK,
                vec![
                    Ebml::bytes(ids::SEEK_ID, id.to_be_bytes().to_vec()).into(),
                    Ebml::uint(ids::SEEK_POSITION, self.segment_relative(mark))
                        .with_size(ElementSize::Width(SEEK_POSITION_WIDTH))
                        .into(),
                ],
            )
            .into()
        };
        let mut children = vec![seek(ids::INFO, Mark::Info), seek(ids::TRACKS, Mark::Tracks)];
        if !simple_tags(&self.tags).is_empty() {
            children.push(seek(ids::TAGS, Mark::Tags));
        }
        if self.has_attachments() {
            children.push(seek(ids::ATTACHMENTS, Mark::Attachments));
        }
        children.push(seek(ids::CUES, Mark::Cues));
        Ebml::master(ids::SEEK_HEAD, children).with_mark(Mark::SeekHead)
    }

    fn info_element(&self) -> Ebml {
        let duration = (!self.options.append_only).then(|| {
            Ebml::float64(ids::DURATION, self.duration_ms as f64).with_mark(Mark::Duration)
        });
        Ebml::master(
            ids::INFO,
            vec![
                Ebml::uint(ids::TIMESTAMP_SCALE, TIMESTAMP_SCALE).into(),
                Ebml::string(ids::MUXING_APP, APP_NAME).into(),
                Ebml::string(ids::WRITING_APP, APP_NAME).into(),
                duration.into(),
            ],
        )
        .with_mark(Mark::Info)
    }

    fn tracks_element(&self) -> Result<Ebml, MuxError> {
        let entries = self
            .tracks
            .iter()
            .map(|t| track_entry(t).map(EbmlNode::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Ebml::master(ids::TRACKS, entries).with_mark(Mark::Tracks))
    }

    fn tags_element(&self) -> Option<Ebml> {
        let simple = simple_tags(&self.tags);
        if simple.is_empty() {
            return None;
        }
        let targets = Ebml::master(
            ids::TARGETS,
            vec![
                Ebml::uint(ids::TARGET_TYPE_VALUE, 50).into(),
                Ebml::string(ids::TARGET_TYPE, "MOVIE").into(),
            ],
        );
        let mut tag = vec![targets.into()];
        tag.extend(simple);
        Some(
            Ebml::master(ids::TAGS, vec![Ebml::master(ids::TAG, tag).into()])
                .with_mark(Mark::Tags),
        )
    }

    fn attachments_element(&self) -> Option<Ebml> {
        if !self.has_attachments() {
            return None;
        }
        let files = self
            .tags
            .images
            .iter()
            .enumerate()
            .map(|(i, image)| attached_file(image, i as u64 + 1).into())
            .collect();
        Some(Ebml::master(ids::ATTACHMENTS, files).with_mark(Mark::Attachments))
    }

    fn video_track(
        &mut self,
        id: u32,
        config: Option<VideoDecoderConfig>,
        first_packet: &EncodedPacket,
    ) -> Result<usize, MuxError> {
        if let Some(i) = self.track_index(id) {
            return Ok(i);
        }
        let info = self.info(id)?;
        let config = config.ok_or_else(|| missing_config(id))?;
        let (config, length_prefix) = resolve_video_config(config, &first_packet.data)?;
        Ok(self.insert_track(
            info,
            TrackConfig::Video {
                config,
                length_prefix,
                has_alpha: first_packet.side_data.alpha.is_some(),
                color_fixed: false,
            },
        ))
    }

    fn audio_track(
        &mut self,
        id: u32,
        config: Option<AudioDecoderConfig>,
    ) -> Result<usize, MuxError> {
        if let Some(i) = self.track_index(id) {
            return Ok(i);
        }
        let info = self.info(id)?;
        let mut config = config.ok_or_else(|| missing_config(id))?;
        config.description = resolve_audio_description(&config)?;
        if config.codec == AudioCodec::Opus {
            parse_opus_head(config.description.as_deref().unwrap_or_default())
                .map_err(|e| MuxError::validation("config.description", e.reason))?;
        }
        Ok(self.insert_track(info, TrackConfig::Audio { config }))
    }

    fn subtitle_track(
        &mut self,
        id: u32,
        config: Option<SubtitleConfig>,
    ) -> Result<usize, MuxError> {
        if let Some(i) = self.track_index(id) {
            return Ok(i);
        }
        let info = self.info(id)?;
        let config = config.ok_or_else(|| missing_config(id))?;
        Ok(self.insert_track(info, TrackConfig::Subtitle { config }))
    }

    fn enqueue(&mut self, index: usize, block: Block) -> Result<(), MuxError> {
        tracing::trace!(
            track_id = self.tracks[index].info.id,
            timestamp = block.timestamp,
            size = block.data.len(),
            key = block.is_key,
            "block queued"
        );
        self.tracks[index].queue.push_back(block);
        self.interleave(false)
    }

    /// 全トラックのキューから表示タイムスタンプが最小のブロックを順に書き込む
    fn interleave(&mut self, is_final: bool) -> Result<(), MuxError> {
        if !is_final && !self.all_tracks_known() {
            return Ok(());
        }
        if !self.segment_created {
            self.create_segment()?;
        }
        let mut written = false;
        loop {
            let mut next: Option<(usize, f64)> = None;
            let mut blocked = false;
            for (j, t) in self.tracks.iter().enumerate() {
                match t.queue.front() {
                    None if !is_final && !self.is_closed(t.info.id) => {
                        blocked = true;
                        break;
                    }
                    None => {}
                    Some(block) => {
                        if next.is_none_or(|(_, min)| block.timestamp < min) {
                            next = Some((j, block.timestamp));
                        }
                    }
                }
            }
            if blocked {
                break;
            }
            let Some((j, _)) = next else {
                break;
            };
            if let Some(block) = self.tracks[j].queue.pop_front() {
                self.write_block(j, block)?;
                written = true;
            }
        }
        if written {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn key_frame_queued_everywhere(&self, index: usize, is_key: bool) -> bool {
        self.tracks.iter().enumerate().all(|(j, t)| {
            if j == index {
                return is_key;
            }
            match t.queue.front() {
                Some(block) => block.is_key,
                None => self.is_closed(t.info.id),
            }
        })
    }

    fn write_block(&mut self, index: usize, block: Block) -> Result<(), MuxError> {
        let track_id = self.tracks[index].info.id;
        let is_subtitle = self.tracks[index].info.codec.kind() == MediaKind::Subtitle;
        let ms = (block.timestamp * 1000.0).round() as i64;
        let duration_ms = (block.duration * 1000.0).round() as i64;

        let begin_new_cluster = match &self.cluster {
            None => true,
            Some(cluster) => {
                let relative = ms - cluster.timestamp_ms;
                let minimum = (self.options.minimum_cluster_duration * 1000.0).round() as i64;
                (self.key_frame_queued_everywhere(index, block.is_key)
                    && ms > cluster.max_written_ms
                    && relative >= minimum)
                    || relative > i16::MAX as i64
            }
        };
        if begin_new_cluster {
            self.create_cluster(ms)?;
        }

        let Some(cluster) = &mut self.cluster else {
            return Err(Error::internal("No cluster to write a block into").into());
        };
        let relative = ms - cluster.timestamp_ms;
        if relative < i16::MIN as i64 {
            return Err(MuxError::ClusterTimestampOutOfRange {
                track_id,
                relative_timestamp: relative,
            });
        }
        cluster.max_written_ms = cluster.max_written_ms.max(ms);
        if !cluster.first_timestamps.iter().any(|&(id, _)| id == track_id) {
            cluster.first_timestamps.push((track_id, ms));
        }

        let mut payload = Vec::with_capacity(4 + block.data.len());
        payload.push(0x80 | track_id as u8);
        payload.extend_from_slice(&(relative as i16).to_be_bytes());

        let track = &mut self.tracks[index];
        let node: EbmlNode = if block.additions.is_none() && !is_subtitle {
            payload.push(if block.is_key { 0x80 } else { 0 });
            payload.extend_from_slice(&block.data);
            Ebml::bytes(ids::SIMPLE_BLOCK, payload).into()
        } else {
            payload.push(0);
            payload.extend_from_slice(&block.data);
            let reference = track
                .last_written_ms
                .filter(|_| !block.is_key)
                .map(|last| Ebml::int(ids::REFERENCE_BLOCK, last - ms));
            let additions = block.additions.map(|additional| {
                Ebml::master(
                    ids::BLOCK_ADDITIONS,
                    vec![
                        Ebml::master(
                            ids::BLOCK_MORE,
                            vec![
                                Ebml::uint(ids::BLOCK_ADD_ID, 1).into(),
                                Ebml::bytes(ids::BLOCK_ADDITIONAL, additional).into(),
                            ],
                        )
                        .into(),
                    ],
                )
            });
            let duration = (duration_ms > 0)
                .then(|| Ebml::uint(ids::BLOCK_DURATION, duration_ms as u64));
            Ebml::master(
                ids::BLOCK_GROUP,
                vec![
                    Ebml::bytes(ids::BLOCK, payload).into(),
                    reference.into(),
                    additions.into(),
                    duration.into(),
                ],
            )
            .into()
        };
        track.last_written_ms = Some(ms);
        self.duration_ms = self.duration_ms.max(ms + duration_ms);
        self.ebml.write(&mut self.writer, &node)?;
        Ok(())
    }

    fn create_cluster(&mut self, timestamp_ms: i64) -> Result<(), MuxError> {
        self.finalize_cluster()?;
        if self.options.on_cluster.is_some() {
            self.writer.start_tracking_writes();
        }
        let size = if self.options.append_only {
            ElementSize::Unknown
        } else {
            ElementSize::Width(CLUSTER_SIZE_WIDTH)
        };
        self.write_node(
            Ebml::master(
                ids::CLUSTER,
                vec![Ebml::uint(ids::TIMESTAMP, timestamp_ms.max(0) as u64).into()],
            )
            .with_size(size)
            .with_mark(Mark::Cluster),
        )?;
        let (Some(offset), Some(data_offset)) = (
            self.ebml.offset(Mark::Cluster),
            self.ebml.data_offset(Mark::Cluster),
        ) else {
            return Err(Error::internal("Cluster position was not recorded").into());
        };
        self.cluster = Some(Cluster {
            timestamp_ms,
            max_written_ms: timestamp_ms,
            offset,
            data_offset,
            first_timestamps: Vec::new(),
        });
        Ok(())
    }

    /// 現在のクラスターのサイズを確定させて、キューポイントを登録する
    fn finalize_cluster(&mut self) -> Result<(), MuxError> {
        let Some(cluster) = self.cluster.take() else {
            return Ok(());
        };
        if !self.options.append_only {
            let end = self.writer.pos();
            self.writer.seek(cluster.offset + 4);
            write_var_int(
                &mut self.writer,
                end - cluster.data_offset,
                CLUSTER_SIZE_WIDTH,
            )?;
            self.writer.seek(end);
        }
        if let Some(callback) = self.options.on_cluster.clone() {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start, cluster.timestamp_ms as f64 / 1000.0);
        }

        let position = cluster
            .offset
            .saturating_sub(self.ebml.data_offset(Mark::Segment).unwrap_or(0));
        for &(track_id, time_ms) in &cluster.first_timestamps {
            match self.cue_points.iter_mut().find(|c| c.time_ms == time_ms) {
                Some(cue) if cue.positions.iter().all(|&(_, p)| p == position) => {
                    cue.positions.push((track_id, position));
                }
                _ => self.cue_points.push(CuePoint {
                    time_ms,
                    positions: vec![(track_id, position)],
                }),
            }
        }
        tracing::debug!(
            timestamp_ms = cluster.timestamp_ms,
            tracks = cluster.first_timestamps.len(),
            "cluster written"
        );
        self.writer.flush()?;
        Ok(())
    }

    fn cues_element(&self) -> Ebml {
        let points = self
            .cue_points
            .iter()
            .map(|cue| {
                let mut children = vec![Ebml::uint(ids::CUE_TIME, cue.time_ms.max(0) as u64).into()];
                children.extend(cue.positions.iter().map(|&(track_id, position)| {
                    Ebml::master(
                        ids::CUE_TRACK_POSITIONS,
                        vec![
                            Ebml::uint(ids::CUE_TRACK, track_id as u64).into(),
                            Ebml::uint(ids::CUE_CLUSTER_POSITION, position).into(),
                        ],
                    )
                    .into()
                }));
                Ebml::master(ids::CUE_POINT, children).into()
            })
            .collect();
        Ebml::master(ids::CUES, points).with_mark(Mark::Cues)
    }

    /// セグメントのサイズ、尺、シークヘッドを最終的な値で書き換える
    fn patch_segment(&mut self) -> Result<(), MuxError> {
        let end = self.writer.pos();
        let (Some(segment), Some(segment_data), Some(duration), Some(seek_head)) = (
            self.ebml.offset(Mark::Segment),
            self.ebml.data_offset(Mark::Segment),
            self.ebml.offset(Mark::Duration),
            self.ebml.offset(Mark::SeekHead),
        ) else {
            return Err(Error::internal("Segment positions were not recorded").into());
        };

        self.writer.seek(segment + 4);
        write_var_int(&mut self.writer, end - segment_data, SEGMENT_SIZE_WIDTH)?;

        self.writer.seek(duration);
        self.write_node(Ebml::float64(ids::DURATION, self.duration_ms as f64))?;

        self.writer.seek(seek_head);
        let seek_head = self.seek_head();
        self.write_node(seek_head)?;

        self.writer.seek(end);
        Ok(())
    }
}

impl Muxer for MatroskaMuxer {
    fn start(&mut self) -> Result<(), MuxError> {
        if self.options.append_only {
            self.writer.set_ensure_monotonicity(true);
        }
        Ok(())
    }

    fn add_video_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<VideoDecoderConfig>,
    ) -> Result<(), MuxError> {
        let index = self.video_track(track_id, config, &packet)?;
        let is_key = packet.is_key();
        let TrackConfig::Video {
            config,
            length_prefix,
            color_fixed,
            ..
        } = &mut self.tracks[index].config
        else {
            return Err(Error::internal("Track is not a video track").into());
        };

        let mut data = if *length_prefix {
            annex_b_to_length_prefixed(&packet.data)?
        } else {
            packet.data
        };
        if config.codec == VideoCodec::Vp9
            && is_key
            && !*color_fixed
            && let Some(matrix) = config.color_space.and_then(|c| c.matrix)
        {
            if fix_vp9_color_space(&mut data, matrix)? {
                tracing::debug!(track_id, "VP9 color space rewritten in the first key frame");
            }
            *color_fixed = true;
        }
        self.enqueue(
            index,
            Block {
                timestamp: packet.timestamp,
                duration: packet.duration,
                data,
                is_key,
                additions: packet.side_data.alpha,
            },
        )
    }

    fn add_audio_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<AudioDecoderConfig>,
    ) -> Result<(), MuxError> {
        let index = self.audio_track(track_id, config)?;
        let is_key = packet.is_key();
        self.enqueue(
            index,
            Block {
                timestamp: packet.timestamp,
                duration: packet.duration,
                data: packet.data,
                is_key,
                additions: None,
            },
        )
    }

    fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        cue: SubtitleCue,
        config: Option<SubtitleConfig>,
    ) -> Result<(), MuxError> {
        let index = self.subtitle_track(track_id, config)?;
        let body = rebase_inline_timestamps(&cue.text, cue.timestamp);
        let additions = [
            cue.settings.as_deref().unwrap_or_default(),
            cue.identifier.as_deref().unwrap_or_default(),
            cue.notes.as_deref().unwrap_or_default(),
        ]
        .join("\n");
        let additions = (!additions.trim().is_empty()).then(|| additions.into_bytes());
        self.enqueue(
            index,
            Block {
                timestamp: cue.timestamp,
                duration: cue.duration,
                data: body.into_bytes(),
                is_key: true,
                additions,
            },
        )
    }

    fn close_track(&mut self, track_id: u32) -> Result<(), MuxError> {
        if let Some(closed) = self.closed.get_mut(track_id as usize - 1) {
            *closed = true;
        }
        self.interleave(false)
    }

    fn finalize(&mut self) -> Result<(), MuxError> {
        self.interleave(true)?;
        self.finalize_cluster()?;
        let cues = self.cues_element();
        self.write_node(cues)?;
        if !self.options.append_only {
            self.patch_segment()?;
        }
        tracing::debug!(
            duration_ms = self.duration_ms,
            cue_points = self.cue_points.len(),
            "segment finalized"
        );
        self.writer.finalize()?;
        Ok(())
    }

    fn cancel(&mut self) -> Result<usize, MuxError> {
        let discarded = self.tracks.iter().map(|t| t.queue.len()).sum();
        self.writer.finalize()?;
        Ok(discarded)
    }

    fn codec_strings(&self) -> Option<Vec<(MediaKind, String)>> {
        let mut codecs = Vec::new();
        for info in &self.infos {
            match self.track_index(info.id) {
                Some(j) => codecs.push((info.codec.kind(), self.tracks[j].codec_string())),
                None if self.is_closed(info.id) => {}
                None => return None,
            }
        }
        Some(codecs)
    }

    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.writer.take_buffer()
    }
}

fn missing_config(track_id: u32) -> MuxError {
    MuxError::validation(
        "config",
        format!("A decoder configuration must be provided with the first packet of track #{track_id}"),
    )
}

fn codec_id(track: &MkvTrack) -> &'static str {
    match &track.config {
        TrackConfig::Video { config, .. } => match config.codec {
            VideoCodec::Avc => "V_MPEG4/ISO/AVC",
            VideoCodec::Hevc => "V_MPEGH/ISO/HEVC",
            VideoCodec::Vp8 => "V_VP8",
            VideoCodec::Vp9 => "V_VP9",
            VideoCodec::Av1 => "V_AV1",
        },
        TrackConfig::Audio { config } => match config.codec {
            AudioCodec::Aac => "A_AAC",
            AudioCodec::Mp3 => "A_MPEG/L3",
            AudioCodec::Opus => "A_OPUS",
            AudioCodec::Vorbis => "A_VORBIS",
            AudioCodec::Flac => "A_FLAC",
            AudioCodec::Pcm(pcm) => match pcm.data_type {
                PcmDataType::Float => "A_PCM/FLOAT/IEEE",
                _ if pcm.little_endian => "A_PCM/INT/LIT",
                _ => "A_PCM/INT/BIG",
            },
        },
        TrackConfig::Subtitle { .. } => "S_TEXT/WEBVTT",
    }
}

fn codec_private(track: &MkvTrack) -> Result<Option<Vec<u8>>, MuxError> {
    let invalid = |e: Error| MuxError::validation("config.codec_string", e.reason);
    match &track.config {
        TrackConfig::Video { config, .. } => match config.codec {
            VideoCodec::Avc | VideoCodec::Hevc => Ok(config.description.clone()),
            VideoCodec::Vp8 => Ok(None),
            VideoCodec::Vp9 => Ok(Some(
                VpCodecConfig::from_vp9_codec_string(
                    &config.codec_string,
                    config.color_space.as_ref(),
                )
                .map_err(invalid)?
                .to_matroska_codec_private(),
            )),
            VideoCodec::Av1 => Ok(Some(
                av1_config_from_codec_string(&config.codec_string)
                    .map_err(invalid)?
                    .to_vec(),
            )),
        },
        TrackConfig::Audio { config } => Ok(config.description.clone()),
        TrackConfig::Subtitle { config } => Ok(Some(config.description.clone().into_bytes())),
    }
}

fn colour(color_space: &VideoColorSpace) -> Option<Ebml> {
    let children: Vec<EbmlNode> = [
        color_space
            .matrix
            .map(|m| Ebml::uint(ids::MATRIX_COEFFICIENTS, m.code() as u64)),
        color_space
            .full_range
            .map(|full| Ebml::uint(ids::RANGE, if full { 2 } else { 1 })),
        color_space
            .transfer
            .map(|t| Ebml::uint(ids::TRANSFER_CHARACTERISTICS, t.code() as u64)),
        color_space
            .primaries
            .map(|p| Ebml::uint(ids::PRIMARIES, p.code() as u64)),
    ]
    .into_iter()
    .flatten()
    .map(EbmlNode::from)
    .collect();
    (!children.is_empty()).then(|| Ebml::master(ids::COLOUR, children))
}

fn track_entry(track: &MkvTrack) -> Result<Ebml, MuxError> {
    let metadata = &track.info.metadata;
    let id = track.info.id as u64;
    let track_type = match track.info.codec.kind() {
        MediaKind::Video => 1,
        MediaKind::Audio => 2,
        MediaKind::Subtitle => 17,
    };
    let mut children: Vec<EbmlNode> = vec![
        Ebml::uint(ids::TRACK_NUMBER, id).into(),
        Ebml::uint(ids::TRACK_UID, id).into(),
        Ebml::uint(ids::TRACK_TYPE, track_type).into(),
        (!metadata.disposition.default)
            .then(|| Ebml::uint(ids::FLAG_DEFAULT, 0))
            .into(),
        metadata
            .disposition
            .forced
            .then(|| Ebml::uint(ids::FLAG_FORCED, 1))
            .into(),
        Ebml::uint(ids::FLAG_LACING, 0).into(),
        Ebml::string(ids::LANGUAGE, metadata.language.clone()).into(),
        Ebml::string(ids::CODEC_ID, codec_id(track)).into(),
        codec_private(track)?
            .map(|p| Ebml::bytes(ids::CODEC_PRIVATE, p))
            .into(),
        metadata
            .name
            .as_ref()
            .map(|name| Ebml::string(ids::NAME, name.clone()))
            .into(),
    ];

    match &track.config {
        TrackConfig::Video {
            config, has_alpha, ..
        } => {
            if let Some(frame_rate) = metadata.frame_rate {
                children.push(
                    Ebml::uint(ids::DEFAULT_DURATION, (1e9 / frame_rate).round() as u64).into(),
                );
            }
            let degrees = metadata.rotation.degrees();
            let projection = (degrees != 0).then(|| {
                let roll = (180 - degrees).rem_euclid(360) - 180;
                Ebml::master(
                    ids::PROJECTION,
                    vec![
                        Ebml::uint(ids::PROJECTION_TYPE, 0).into(),
                        Ebml::float32(ids::PROJECTION_POSE_ROLL, roll as f32).into(),
                    ],
                )
            });
            children.push(
                Ebml::master(
                    ids::VIDEO,
                    vec![
                        Ebml::uint(ids::PIXEL_WIDTH, config.coded_width as u64).into(),
                        Ebml::uint(ids::PIXEL_HEIGHT, config.coded_height as u64).into(),
                        has_alpha.then(|| Ebml::uint(ids::ALPHA_MODE, 1)).into(),
                        config.color_space.as_ref().and_then(colour).into(),
                        projection.into(),
                    ],
                )
                .into(),
            );
        }
        TrackConfig::Audio { config } => {
            if config.codec == AudioCodec::Opus {
                let head = parse_opus_head(config.description.as_deref().unwrap_or_default())
                    .map_err(|e| MuxError::validation("config.description", e.reason))?;
                let codec_delay = head.pre_skip as u64 * 1_000_000_000 / 48_000;
                children.push(Ebml::uint(ids::CODEC_DELAY, codec_delay).into());
                children.push(Ebml::uint(ids::SEEK_PRE_ROLL, OPUS_SEEK_PRE_ROLL_NS).into());
            }
            let bit_depth = match config.codec {
                AudioCodec::Pcm(pcm) => Some(Ebml::uint(ids::BIT_DEPTH, pcm.sample_size as u64 * 8)),
                _ => None,
            };
            children.push(
                Ebml::master(
                    ids::AUDIO,
                    vec![
                        Ebml::float32(ids::SAMPLING_FREQUENCY, config.sample_rate as f32).into(),
                        Ebml::uint(ids::CHANNELS, config.number_of_channels as u64).into(),
                        bit_depth.into(),
                    ],
                )
                .into(),
            );
        }
        TrackConfig::Subtitle { .. } => {}
    }
    Ok(Ebml::master(ids::TRACK_ENTRY, children))
}

fn simple_tags(tags: &MetadataTags) -> Vec<EbmlNode> {
    let simple = |name: &str, value: Ebml| -> EbmlNode {
        Ebml::master(
            ids::SIMPLE_TAG,
            vec![Ebml::string(ids::TAG_NAME, name).into(), value.into()],
        )
        .into()
    };
    let text_fields = [
        ("TITLE", &tags.title),
        ("DESCRIPTION", &tags.description),
        ("ARTIST", &tags.artist),
        ("ALBUM", &tags.album),
        ("ALBUM_ARTIST", &tags.album_artist),
        ("GENRE", &tags.genre),
        ("DATE", &tags.date),
        ("COMMENT", &tags.comment),
    ];
    let mut nodes: Vec<EbmlNode> = text_fields
        .into_iter()
        .filter_map(|(name, value)| {
            let value = value.as_ref()?;
            Some(simple(name, Ebml::string(ids::TAG_STRING, value.clone())))
        })
        .collect();
    nodes.extend(tags.raw.iter().map(|(name, value)| {
        let value = match value {
            RawTagValue::Text(text) => Ebml::string(ids::TAG_STRING, text.clone()),
            RawTagValue::Binary(bytes) => Ebml::bytes(ids::TAG_BINARY, bytes.clone()),
        };
        simple(name, value)
    }));
    nodes
}

fn attached_file(image: &AttachedImage, uid: u64) -> Ebml {
    let name = image.name.clone().unwrap_or_else(|| {
        let stem = match image.kind {
            AttachedImageKind::CoverFront => "cover",
            AttachedImageKind::CoverBack => "back",
            AttachedImageKind::Unknown => "image",
        };
        let extension = image
            .mime_type
            .split_once('/')
            .map(|(_, sub)| if sub == "jpeg" { "jpg" } else { sub })
            .unwrap_or("bin");
        format!("{stem}.{extension}")
    });
    Ebml::master(
        ids::ATTACHED_FILE,
        vec![
            image
                .description
                .as_ref()
                .map(|d| Ebml::string(ids::FILE_DESCRIPTION, d.clone()))
                .into(),
            Ebml::string(ids::FILE_NAME, name).into(),
            Ebml::string(ids::FILE_MEDIA_TYPE, image.mime_type.clone()).into(),
            Ebml::bytes(ids::FILE_DATA, image.data.clone()).into(),
            Ebml::uint(ids::FILE_UID, uid).into(),
        ],
    )
}
