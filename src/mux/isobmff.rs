//! MP4 / MOV 形式のマルチプレクサー
//!
//! サンプルはトラックごとのチャンク（fMP4 ではフラグメント）にまとめて書き込まれ、
//! サンプルテーブル (stts / ctts / stsc / stsz / stco / stss) はサンプルの追加に合わせて逐次構築される。
use std::{
    collections::VecDeque,
    time::{SystemTime, UNIX_EPOCH},
};

use super::{
    FastStart, IsoOptions, MuxError, Muxer, TrackInfo, into_timescale, resolve_audio_description,
    resolve_video_config, webvtt::WebVttCueSplitter,
};
use crate::{
    Error,
    boxes::{
        self, CompositionOffsetEntry, FragmentSample, FtypKind, LARGE_BOX_HEADER_SIZE, Node,
        RandomAccessEntry, SampleToChunkEntry, SoundEntry, TimeToSampleEntry, TrackHeader,
        BOX_HEADER_SIZE, GLOBAL_TIMESCALE, MAC_EPOCH_OFFSET, boxed, full_box,
    },
    codec::{
        PcmDataType, PcmFormat, VpCodecConfig, annex_b_to_length_prefixed,
        av1_config_from_codec_string, parse_flac_header, parse_opus_head,
    },
    metadata::{
        AudioCodec, AudioDecoderConfig, EncodedPacket, MediaKind, MetadataTags, SubtitleConfig,
        SubtitleCue, TrackCodec, VideoCodec, VideoDecoderConfig,
    },
    writer::Writer,
};

/// 通常モードでチャンクを区切る間隔（秒）
const CHUNK_DURATION: f64 = 0.5;

/// フレームレートが指定されていない映像トラックのタイムスケール
const DEFAULT_VIDEO_TIMESCALE_RATE: f64 = 57600.0;

const MAX_TIMESCALE_DENOMINATOR: f64 = 1e6;

const SUBTITLE_TIMESCALE: u32 = 1000;

/// [`FastStart::Reserve`] で moov 用に確保する領域の余白
const MOOV_RESERVE_MARGIN: u64 = 4096;

/// `1 / frame_rate` を連分数で近似したときの分母をタイムスケールとして使う
fn timescale_for_frame_rate(frame_rate: f64) -> u32 {
    let mut x = 1.0 / frame_rate;
    let (mut prev, mut current) = (1.0f64, 0.0f64);
    loop {
        let integer = x.floor();
        let next = integer * current + prev;
        if next > MAX_TIMESCALE_DENOMINATOR {
            break;
        }
        prev = current;
        current = next;
        let frac = x - integer;
        if frac == 0.0 {
            break;
        }
        x = 1.0 / frac;
        if !x.is_finite() {
            break;
        }
    }
    (current as u32).max(1)
}

#[derive(Debug)]
struct Sample {
    timestamp: f64,
    decode_timestamp: f64,
    duration: f64,

    /// 書き込み済みになると `None`
    data: Option<Vec<u8>>,
    size: u32,
    is_key: bool,
    units_to_next_sample: u64,
}

#[derive(Debug)]
struct Chunk {
    start_timestamp: f64,
    samples: Vec<usize>,
    offset: u64,
    moof_offset: u64,
    traf_number: u32,
}

#[derive(Debug)]
enum TrackConfig {
    Video {
        config: VideoDecoderConfig,
        length_prefix: bool,
    },
    Audio {
        config: AudioDecoderConfig,

        /// 非フラグメントの PCM ではサンプルをフレーム単位で扱う
        pcm_frame_size: Option<u32>,
        pcm: Option<PcmFormat>,
    },
    Subtitle {
        splitter: WebVttCueSplitter,
    },
}

#[derive(Debug)]
struct IsoTrack {
    info: TrackInfo,
    config: TrackConfig,
    sample_entry: Node,
    timescale: u32,

    samples: Vec<Sample>,
    sample_queue: VecDeque<usize>,
    processing_queue: Vec<usize>,
    added_samples: u64,

    time_to_sample: Vec<TimeToSampleEntry>,
    composition_offsets: Vec<CompositionOffsetEntry>,
    sample_to_chunk: Vec<SampleToChunkEntry>,
    current_chunk: Option<Chunk>,

    /// 閉じられたがまだ書き込まれていないチャンク（非フラグメント）
    finished_chunks: VecDeque<Chunk>,
    chunks: Vec<Chunk>,

    last_timescale_units: Option<f64>,
    last_sample: Option<usize>,
}

impl IsoTrack {
    fn new(info: TrackInfo, config: TrackConfig, sample_entry: Node, timescale: u32) -> Self {
        Self {
            info,
            config,
            sample_entry,
            timescale,
            samples: Vec::new(),
            sample_queue: VecDeque::new(),
            processing_queue: Vec::new(),
            added_samples: 0,
            time_to_sample: Vec::new(),
            composition_offsets: Vec::new(),
            sample_to_chunk: Vec::new(),
            current_chunk: None,
            finished_chunks: VecDeque::new(),
            chunks: Vec::new(),
            last_timescale_units: None,
            last_sample: None,
        }
    }

    fn pcm_frame_size(&self) -> Option<u32> {
        match self.config {
            TrackConfig::Audio { pcm_frame_size, .. } => pcm_frame_size,
            _ => None,
        }
    }

    fn kind(&self) -> MediaKind {
        self.info.codec.kind()
    }

    /// 表示時刻が最も遅いサンプルの終了時刻
    fn end_timestamp(&self) -> f64 {
        self.samples
            .iter()
            .max_by(|a, b| a.timestamp.total_cmp(&b.timestamp))
            .map_or(0.0, |s| s.timestamp + s.duration)
    }

    fn composition_offset(&self, sample: &Sample) -> i32 {
        ((sample.timestamp - sample.decode_timestamp) * self.timescale as f64).round() as i32
    }

    fn codec_string(&self) -> String {
        match &self.config {
            TrackConfig::Video { config, .. } => config.codec_string.clone(),
            TrackConfig::Audio { config, .. } => config.codec_string.clone(),
            TrackConfig::Subtitle { .. } => "wvtt".to_owned(),
        }
    }
}

pub(crate) struct IsoMuxer {
    writer: Writer,
    options: IsoOptions,
    quicktime: bool,
    infos: Vec<TrackInfo>,
    closed: Vec<bool>,
    tags: MetadataTags,

    /// サンプルを受け取ったトラック（ID 順）
    tracks: Vec<IsoTrack>,
    creation_time: u64,
    ftyp_size: u64,
    mdat_pos: Option<u64>,

    /// 書き込み順の (トラック ID, チャンク番号)
    finalized_chunks: Vec<(u32, usize)>,
    next_fragment_number: u32,
    max_written_timestamp: f64,
}

impl IsoMuxer {
    pub fn new(
        writer: Writer,
        infos: Vec<TrackInfo>,
        tags: MetadataTags,
        options: IsoOptions,
        quicktime: bool,
    ) -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
            + MAC_EPOCH_OFFSET;
        Self {
            writer,
            options,
            quicktime,
            closed: vec![false; infos.len()],
            infos,
            tags,
            tracks: Vec::new(),
            creation_time,
            ftyp_size: 0,
            mdat_pos: None,
            finalized_chunks: Vec::new(),
            next_fragment_number: 1,
            max_written_timestamp: f64::NEG_INFINITY,
        }
    }

    fn fragmented(&self) -> bool {
        self.options.fast_start == FastStart::Fragmented
    }

    fn track_index(&self, id: u32) -> Option<usize> {
        self.tracks.iter().position(|t| t.info.id == id)
    }

    fn is_closed(&self, id: u32) -> bool {
        self.closed.get(id as usize - 1).copied().unwrap_or(true)
    }

    /// 全てのトラックが、サンプルを受け取ったか閉じられたかのいずれかである
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

    fn insert_track(&mut self, track: IsoTrack) -> usize {
        let id = track.info.id;
        tracing::debug!(track_id = id, timescale = track.timescale, "track configured");
        self.tracks.push(track);
        self.tracks.sort_by_key(|t| t.info.id);
        self.tracks.iter().position(|t| t.info.id == id).unwrap_or(0)
    }

    fn video_track(
        &mut self,
        id: u32,
        config: Option<VideoDecoderConfig>,
        first_packet: &[u8],
    ) -> Result<usize, MuxError> {
        if let Some(i) = self.track_index(id) {
            return Ok(i);
        }
        let info = self.info(id)?;
        let config = config.ok_or_else(|| missing_config(id))?;
        let (config, length_prefix) = resolve_video_config(config, first_packet)?;
        let sample_entry = video_sample_entry(&config)?;
        let timescale = timescale_for_frame_rate(
            info.metadata
                .frame_rate
                .unwrap_or(DEFAULT_VIDEO_TIMESCALE_RATE),
        );
        Ok(self.insert_track(IsoTrack::new(
            info,
            TrackConfig::Video {
                config,
                length_prefix,
            },
            sample_entry,
            timescale,
        )))
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
        let sample_entry = audio_sample_entry(&config, self.quicktime)?;
        let pcm = match config.codec {
            AudioCodec::Pcm(pcm) => Some(pcm),
            _ => None,
        };
        let pcm_frame_size = pcm
            .filter(|_| !self.fragmented())
            .map(|p| p.sample_size as u32 * config.number_of_channels);
        let timescale = config.sample_rate;
        Ok(self.insert_track(IsoTrack::new(
            info,
            TrackConfig::Audio {
                config,
                pcm_frame_size,
                pcm,
            },
            sample_entry,
            timescale,
        )))
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
        let sample_entry = boxes::subtitle_sample_entry(
            b"wvtt",
            vec![boxed(b"vttC", config.description.into_bytes(), vec![])],
        );
        Ok(self.insert_track(IsoTrack::new(
            info,
            TrackConfig::Subtitle {
                splitter: WebVttCueSplitter::default(),
            },
            sample_entry,
            SUBTITLE_TIMESCALE,
        )))
    }

    fn new_sample(&self, index: usize, data: Vec<u8>, timestamp: f64, duration: f64, is_key: bool) -> Sample {
        let timescale = self.tracks[index].timescale;
        Sample {
            timestamp,
            decode_timestamp: timestamp,
            duration,
            size: data.len() as u32,
            data: Some(data),
            is_key,
            units_to_next_sample: into_timescale(duration, timescale),
        }
    }

    fn register_sample(&mut self, index: usize, sample: Sample) -> Result<(), MuxError> {
        if sample.is_key {
            self.process_timestamps(index, Some(sample.timestamp))?;
        }
        let track = &mut self.tracks[index];
        tracing::trace!(
            track_id = track.info.id,
            timestamp = sample.timestamp,
            size = sample.size,
            key = sample.is_key,
            "sample registered"
        );
        let s = track.samples.len();
        track.samples.push(sample);
        track.processing_queue.push(s);

        match self.options.fast_start {
            FastStart::Fragmented => {
                self.tracks[index].sample_queue.push_back(s);
                self.interleave(false)
            }
            FastStart::Reserve => {
                if self.mdat_pos.is_none() && !self.all_tracks_known() {
                    self.tracks[index].sample_queue.push_back(s);
                    return Ok(());
                }
                if self.mdat_pos.is_none() {
                    self.create_reservation()?;
                }
                self.add_sample_to_track(index, s)?;
                self.write_finished_chunks(false)
            }
            FastStart::None | FastStart::InMemory => {
                self.add_sample_to_track(index, s)?;
                self.write_finished_chunks(false)
            }
        }
    }

    /// キューに溜まったサンプルの復号タイムスタンプを決めて、stts / ctts を更新する
    ///
    /// 復号順は表示タイムスタンプをソートしたものとみなす。
    /// `next_key` は次の GOP の先頭サンプルの表示タイムスタンプ。
    fn process_timestamps(&mut self, index: usize, next_key: Option<f64>) -> Result<(), MuxError> {
        let fragmented = self.fragmented();
        let track = &mut self.tracks[index];
        if track.processing_queue.is_empty() {
            return Ok(());
        }
        let queue = core::mem::take(&mut track.processing_queue);

        if let Some(frame_size) = track.pcm_frame_size() {
            let frames: u32 = queue
                .iter()
                .map(|&i| track.samples[i].size / frame_size)
                .sum();
            match track.time_to_sample.last_mut() {
                Some(entry) => entry.sample_count += frames,
                None => track.time_to_sample.push(TimeToSampleEntry {
                    sample_count: frames,
                    sample_delta: 1,
                }),
            }
            return Ok(());
        }

        let timescale = track.timescale as f64;
        let mut sorted: Vec<f64> = queue.iter().map(|&i| track.samples[i].timestamp).collect();
        sorted.sort_by(f64::total_cmp);

        for (&i, &decode_timestamp) in queue.iter().zip(&sorted) {
            let decode_timestamp = if !fragmented && track.last_timescale_units.is_none() {
                0.0
            } else {
                decode_timestamp
            };
            track.samples[i].decode_timestamp = decode_timestamp;
            let composition_offset = track.composition_offset(&track.samples[i]);
            let duration = into_timescale(track.samples[i].duration, track.timescale) as u32;

            match track.last_timescale_units {
                Some(last_units) => {
                    let delta = (decode_timestamp * timescale - last_units).round().max(0.0);
                    track.last_timescale_units = Some(last_units + delta);
                    let delta = delta as u32;
                    if let Some(prev) = track.last_sample {
                        track.samples[prev].units_to_next_sample = delta as u64;
                    }
                    if !fragmented {
                        push_time_to_sample(&mut track.time_to_sample, delta, duration)?;
                        match track.composition_offsets.last_mut() {
                            Some(e) if e.sample_offset == composition_offset => e.sample_count += 1,
                            _ => track.composition_offsets.push(CompositionOffsetEntry {
                                sample_count: 1,
                                sample_offset: composition_offset,
                            }),
                        }
                    }
                }
                None => {
                    track.last_timescale_units = Some(decode_timestamp * timescale);
                    if !fragmented {
                        track.time_to_sample.push(TimeToSampleEntry {
                            sample_count: 1,
                            sample_delta: duration,
                        });
                        track.composition_offsets.push(CompositionOffsetEntry {
                            sample_count: 1,
                            sample_offset: composition_offset,
                        });
                    }
                }
            }
            track.last_sample = Some(i);
        }

        if let (Some(next), Some(prev), Some(last_units)) =
            (next_key, track.last_sample, track.last_timescale_units)
            && track.samples[prev].units_to_next_sample == 0
        {
            let delta = (next * timescale - last_units).round().max(0.0);
            track.samples[prev].units_to_next_sample = delta as u64;
        }
        Ok(())
    }

    fn key_frame_queued_everywhere(&self, index: usize, is_key: bool) -> bool {
        self.tracks.iter().enumerate().all(|(j, t)| {
            if j == index {
                return is_key;
            }
            match t.sample_queue.front() {
                Some(&s) => t.samples[s].is_key,
                None => self.is_closed(t.info.id),
            }
        })
    }

    fn add_sample_to_track(&mut self, index: usize, s: usize) -> Result<(), MuxError> {
        let fragmented = self.fragmented();
        let reserve = self.options.fast_start == FastStart::Reserve;
        let track = &mut self.tracks[index];
        if !fragmented {
            track.added_samples += 1;
            if reserve
                && let Some(maximum) = track.info.metadata.maximum_packet_count
                && track.added_samples > maximum
            {
                return Err(MuxError::ReservedPacketCountExceeded {
                    track_id: track.info.id,
                    maximum,
                });
            }
        }

        let timestamp = track.samples[s].timestamp;
        let is_key = track.samples[s].is_key;
        let chunk_duration = track.current_chunk.as_mut().map(|chunk| {
            chunk.start_timestamp = chunk.start_timestamp.min(timestamp);
            timestamp - chunk.start_timestamp
        });

        let begin_new_chunk = match chunk_duration {
            None => true,
            Some(duration) if fragmented => {
                if duration >= self.options.minimum_fragment_duration
                    && self.key_frame_queued_everywhere(index, is_key)
                    && timestamp > self.max_written_timestamp
                {
                    self.finalize_fragment(true)?;
                    true
                } else {
                    false
                }
            }
            Some(duration) => duration >= CHUNK_DURATION,
        };

        if begin_new_chunk {
            if !fragmented {
                self.finalize_current_chunk(index);
            }
            self.tracks[index].current_chunk = Some(Chunk {
                start_timestamp: timestamp,
                samples: Vec::new(),
                offset: 0,
                moof_offset: 0,
                traf_number: 0,
            });
        }
        if let Some(chunk) = &mut self.tracks[index].current_chunk {
            chunk.samples.push(s);
        }
        if fragmented {
            self.max_written_timestamp = self.max_written_timestamp.max(timestamp);
        }
        Ok(())
    }

    fn finalize_current_chunk(&mut self, index: usize) {
        let track = &mut self.tracks[index];
        if let Some(chunk) = track.current_chunk.take() {
            track.finished_chunks.push_back(chunk);
        }
    }

    /// 閉じられたチャンクを、全トラックの中で開始時刻が最も早いものから順に書き込む
    ///
    /// 開始時刻が最も早いチャンクがまだ閉じられていない場合はそこで止まる。
    /// `is_final` でない限り、全てのトラックが判明するまでは何も書き込まない。
    fn write_finished_chunks(&mut self, is_final: bool) -> Result<(), MuxError> {
        if !is_final && !self.all_tracks_known() {
            return Ok(());
        }
        loop {
            // (トラック, 開始時刻, 閉じられているか)
            let mut next: Option<(usize, f64, bool)> = None;
            for (j, t) in self.tracks.iter().enumerate() {
                let pending = match (t.finished_chunks.front(), &t.current_chunk) {
                    (Some(c), _) => (c.start_timestamp, true),
                    (None, Some(c)) => (c.start_timestamp, false),
                    (None, None) => continue,
                };
                if next.is_none_or(|(_, min, _)| pending.0 < min) {
                    next = Some((j, pending.0, pending.1));
                }
            }
            let Some((j, _, true)) = next else {
                return Ok(());
            };
            self.write_chunk(j)?;
        }
    }

    fn write_chunk(&mut self, index: usize) -> Result<(), MuxError> {
        let in_memory = self.options.fast_start == FastStart::InMemory;
        let track = &mut self.tracks[index];
        let Some(mut chunk) = track.finished_chunks.pop_front() else {
            return Ok(());
        };

        let sample_count = match track.pcm_frame_size() {
            Some(frame_size) => chunk
                .samples
                .iter()
                .map(|&i| track.samples[i].size / frame_size)
                .sum(),
            None => chunk.samples.len() as u32,
        };
        let chunk_number = track.chunks.len() as u32 + 1;
        if track
            .sample_to_chunk
            .last()
            .is_none_or(|e| e.samples_per_chunk != sample_count)
        {
            track.sample_to_chunk.push(SampleToChunkEntry {
                first_chunk: chunk_number,
                samples_per_chunk: sample_count,
            });
        }

        if !in_memory {
            chunk.offset = self.writer.pos();
            for &i in &chunk.samples {
                if let Some(data) = track.samples[i].data.take() {
                    self.writer.write(&data)?;
                }
            }
        }
        self.finalized_chunks
            .push((track.info.id, track.chunks.len()));
        track.chunks.push(chunk);
        if !in_memory {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// 全トラックのキューから表示タイムスタンプが最小のサンプルを順に取り出してトラックに追加する
    fn interleave(&mut self, is_final: bool) -> Result<(), MuxError> {
        if !is_final && !self.all_tracks_known() {
            return Ok(());
        }
        loop {
            let mut next: Option<(usize, f64)> = None;
            for (j, t) in self.tracks.iter().enumerate() {
                match t.sample_queue.front() {
                    None if !is_final && !self.is_closed(t.info.id) => return Ok(()),
                    None => {}
                    Some(&s) => {
                        let timestamp = t.samples[s].timestamp;
                        if next.is_none_or(|(_, min)| timestamp < min) {
                            next = Some((j, timestamp));
                        }
                    }
                }
            }
            let Some((j, _)) = next else {
                return Ok(());
            };
            if let Some(s) = self.tracks[j].sample_queue.pop_front() {
                self.add_sample_to_track(j, s)?;
            }
        }
    }

    fn create_reservation(&mut self) -> Result<(), MuxError> {
        let moov_size = self.moov().size();
        let upper_bound: u64 = self
            .tracks
            .iter()
            .map(|t| {
                let n = t.info.metadata.maximum_packet_count.unwrap_or(0);
                let two_thirds = (2 * n).div_ceil(3);
                8 * two_thirds // stts
                    + 4 * n // stss
                    + 8 * two_thirds // ctts
                    + 12 * two_thirds // stsc
                    + 4 * n // stsz
                    + 8 * n // co64
            })
            .sum();
        let reserved = moov_size + upper_bound + MOOV_RESERVE_MARGIN;
        tracing::debug!(reserved, "reserving space for moov");

        self.writer.seek(self.ftyp_size + reserved);
        if self.options.on_mdat.is_some() {
            self.writer.start_tracking_writes();
        }
        self.mdat_pos = Some(self.writer.pos());
        self.writer
            .write(&boxes::box_header(b"mdat", LARGE_BOX_HEADER_SIZE, true))?;

        for j in 0..self.tracks.len() {
            while let Some(s) = self.tracks[j].sample_queue.pop_front() {
                self.add_sample_to_track(j, s)?;
            }
        }
        Ok(())
    }

    fn moof(&self, sequence_number: u32, in_fragment: &[usize]) -> Node {
        let mut children = vec![boxes::mfhd(sequence_number)];
        for &j in in_fragment {
            let track = &self.tracks[j];
            let Some(chunk) = &track.current_chunk else {
                continue;
            };
            let samples: Vec<FragmentSample> = chunk
                .samples
                .iter()
                .map(|&i| {
                    let s = &track.samples[i];
                    FragmentSample {
                        duration: s.units_to_next_sample as u32,
                        size: s.size,
                        is_key: s.is_key,
                        composition_offset: track.composition_offset(s),
                    }
                })
                .collect();
            let base_decode_time = chunk.samples.first().map_or(0, |&i| {
                into_timescale(track.samples[i].decode_timestamp, track.timescale)
            });
            let data_offset = chunk.offset as i64 - chunk.moof_offset as i64;
            children.push(boxed(
                b"traf",
                vec![],
                vec![
                    boxes::tfhd(track.info.id, &samples),
                    boxes::tfdt(base_decode_time),
                    boxes::trun(&samples, data_offset as i32),
                ],
            ));
        }
        boxed(b"moof", vec![], children)
    }

    fn write_moov(&mut self) -> Result<(), MuxError> {
        let moov = self.moov();
        let callback = self.options.on_moov.clone();
        if callback.is_some() {
            self.writer.start_tracking_writes();
        }
        moov.write_to(&mut self.writer)?;
        if let Some(callback) = callback {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }
        Ok(())
    }

    /// 各トラックの現在のチャンクを moof + mdat として書き出す
    fn finalize_fragment(&mut self, flush: bool) -> Result<(), MuxError> {
        let sequence_number = self.next_fragment_number;
        self.next_fragment_number += 1;
        if sequence_number == 1 {
            self.write_moov()?;
        }

        let in_fragment: Vec<usize> = (0..self.tracks.len())
            .filter(|&j| self.tracks[j].current_chunk.is_some())
            .collect();
        let moof_offset = self.writer.pos();
        let mdat_start = moof_offset + self.moof(sequence_number, &in_fragment).size();

        let mut pos = mdat_start + BOX_HEADER_SIZE;
        let mut fragment_start = f64::INFINITY;
        for (k, &j) in in_fragment.iter().enumerate() {
            let track = &mut self.tracks[j];
            if let Some(chunk) = &mut track.current_chunk {
                chunk.offset = pos;
                chunk.moof_offset = moof_offset;
                chunk.traf_number = k as u32 + 1;
                pos += chunk
                    .samples
                    .iter()
                    .map(|&i| track.samples[i].size as u64)
                    .sum::<u64>();
                fragment_start = fragment_start.min(chunk.start_timestamp);
            }
        }
        let payload_size = pos - (mdat_start + BOX_HEADER_SIZE);
        let large = payload_size + BOX_HEADER_SIZE > u32::MAX as u64;
        let header_size = if large {
            LARGE_BOX_HEADER_SIZE
        } else {
            BOX_HEADER_SIZE
        };
        if large {
            for &j in &in_fragment {
                if let Some(chunk) = &mut self.tracks[j].current_chunk {
                    chunk.offset += LARGE_BOX_HEADER_SIZE - BOX_HEADER_SIZE;
                }
            }
        }

        let moof = self.moof(sequence_number, &in_fragment);
        let on_moof = self.options.on_moof.clone();
        if on_moof.is_some() {
            self.writer.start_tracking_writes();
        }
        moof.write_to(&mut self.writer)?;
        if let Some(callback) = on_moof {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start, fragment_start);
        }
        Error::check_internal(
            self.writer.pos() == mdat_start,
            "moof size differs from its measured size",
        )?;

        let on_mdat = self.options.on_mdat.clone();
        if on_mdat.is_some() {
            self.writer.start_tracking_writes();
        }
        self.writer.write(&boxes::box_header(
            b"mdat",
            payload_size + header_size,
            large,
        ))?;
        for &j in &in_fragment {
            let track = &mut self.tracks[j];
            if let Some(chunk) = &track.current_chunk {
                for &i in &chunk.samples {
                    if let Some(data) = track.samples[i].data.take() {
                        self.writer.write(&data)?;
                    }
                }
            }
        }
        if let Some(callback) = on_mdat {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }

        for &j in &in_fragment {
            let track = &mut self.tracks[j];
            if let Some(chunk) = track.current_chunk.take() {
                track.chunks.push(chunk);
            }
        }
        tracing::debug!(
            sequence_number,
            tracks = in_fragment.len(),
            start = fragment_start,
            "fragment written"
        );
        if flush {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// 16 バイトの mdat プレースホルダーを実際のサイズで書き換える
    ///
    /// サイズが 32 ビットに収まる場合は先頭 8 バイトを free ボックスにする
    fn patch_mdat_header(&mut self, mdat_pos: u64) -> Result<(), MuxError> {
        let end = self.writer.pos();
        let total = end - mdat_pos;
        self.writer.seek(mdat_pos);
        if total - BOX_HEADER_SIZE <= u32::MAX as u64 {
            self.writer
                .write(&boxes::box_header(b"free", BOX_HEADER_SIZE, false))?;
            self.writer
                .write(&boxes::box_header(b"mdat", total - BOX_HEADER_SIZE, false))?;
        } else {
            self.writer.write(&boxes::box_header(b"mdat", total, true))?;
        }
        self.writer.seek(end);
        Ok(())
    }

    fn finish_mdat_tracking(&mut self) {
        if let Some(callback) = self.options.on_mdat.clone() {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }
    }

    fn finalize_in_memory(&mut self) -> Result<(), MuxError> {
        let order = self.finalized_chunks.clone();
        let mut large = false;
        let mut mdat_size = 0;
        for _ in 0..2 {
            let moov_size = self.moov().size();
            let header_size = if large {
                LARGE_BOX_HEADER_SIZE
            } else {
                BOX_HEADER_SIZE
            };
            let mdat_start = self.writer.pos() + moov_size;
            let mut pos = mdat_start + header_size;
            for &(id, c) in &order {
                let Some(j) = self.track_index(id) else {
                    continue;
                };
                let track = &mut self.tracks[j];
                if let Some(chunk) = track.chunks.get_mut(c) {
                    chunk.offset = pos;
                    pos += chunk
                        .samples
                        .iter()
                        .map(|&i| track.samples[i].size as u64)
                        .sum::<u64>();
                }
            }
            mdat_size = pos - mdat_start;
            if pos <= u32::MAX as u64 {
                break;
            }
            if mdat_size > u32::MAX as u64 {
                large = true;
            }
        }

        self.write_moov()?;
        if self.options.on_mdat.is_some() {
            self.writer.start_tracking_writes();
        }
        self.writer
            .write(&boxes::box_header(b"mdat", mdat_size, large))?;
        for &(id, c) in &order {
            let Some(j) = self.track_index(id) else {
                continue;
            };
            let track = &mut self.tracks[j];
            let Some(chunk) = track.chunks.get(c) else {
                continue;
            };
            for &i in &chunk.samples {
                if let Some(data) = track.samples[i].data.take() {
                    self.writer.write(&data)?;
                }
            }
        }
        self.finish_mdat_tracking();
        Ok(())
    }

    fn finalize_reserved(&mut self) -> Result<(), MuxError> {
        let mdat_pos = self
            .mdat_pos
            .ok_or_else(|| Error::internal("mdat has not been reserved"))?;
        self.patch_mdat_header(mdat_pos)?;
        self.finish_mdat_tracking();
        let end = self.writer.pos();

        let moov_end = self.ftyp_size + self.moov().size();
        let remaining = mdat_pos.checked_sub(moov_end).ok_or_else(|| {
            Error::internal("moov does not fit in the reserved space")
        })?;
        Error::check_internal(
            remaining == 0 || remaining >= BOX_HEADER_SIZE,
            "Reserved space cannot be filled with a free box",
        )?;

        self.writer.seek(self.ftyp_size);
        self.write_moov()?;
        if remaining > 0 {
            boxes::free(remaining).write_to(&mut self.writer)?;
        }
        self.writer.seek(end);
        Ok(())
    }

    fn write_mfra(&mut self) -> Result<(), MuxError> {
        let tfras: Vec<Node> = self
            .tracks
            .iter()
            .map(|track| {
                let entries: Vec<RandomAccessEntry> = track
                    .chunks
                    .iter()
                    .filter_map(|chunk| {
                        let &first = chunk.samples.first()?;
                        Some(RandomAccessEntry {
                            time: into_timescale(track.samples[first].timestamp, track.timescale),
                            moof_offset: chunk.moof_offset,
                            traf_number: chunk.traf_number,
                        })
                    })
                    .collect();
                boxes::tfra(track.info.id, &entries)
            })
            .collect();
        boxes::mfra(tfras).write_to(&mut self.writer)?;
        Ok(())
    }

    fn moov(&self) -> Node {
        let fragmented = self.fragmented();
        let next_track_id = self.tracks.iter().map(|t| t.info.id).max().unwrap_or(0) + 1;
        let duration = if fragmented {
            0
        } else {
            self.tracks
                .iter()
                .map(|t| into_timescale(t.end_timestamp(), GLOBAL_TIMESCALE))
                .max()
                .unwrap_or(0)
        };

        let mut children = vec![boxes::mvhd(self.creation_time, duration, next_track_id)];
        children.extend(self.tracks.iter().map(|t| self.trak(t)));
        if fragmented {
            children.push(boxed(
                b"mvex",
                vec![],
                self.tracks.iter().map(|t| boxes::trex(t.info.id)).collect(),
            ));
        }
        children.push(boxes::udta_metadata(&self.tags).into());
        boxed(b"moov", vec![], children)
    }

    fn trak(&self, track: &IsoTrack) -> Node {
        let fragmented = self.fragmented();
        let end = if fragmented {
            0.0
        } else {
            track.end_timestamp()
        };
        let (width, height) = match &track.config {
            TrackConfig::Video { config, .. } => (config.coded_width, config.coded_height),
            _ => (0, 0),
        };
        let kind = track.kind();
        let tkhd = boxes::tkhd(&TrackHeader {
            creation_time: self.creation_time,
            track_id: track.info.id,
            duration: into_timescale(end, GLOBAL_TIMESCALE),
            enabled: track.info.metadata.disposition.default,
            is_audio: kind == MediaKind::Audio,
            rotation: match kind {
                MediaKind::Video => track.info.metadata.rotation.degrees(),
                _ => 0,
            },
            width,
            height,
        });

        let (handler_type, handler_name, media_header) = match kind {
            MediaKind::Video => ("vide", "VideoHandler", boxes::vmhd()),
            MediaKind::Audio => ("soun", "SoundHandler", boxes::smhd()),
            MediaKind::Subtitle => ("text", "TextHandler", boxes::nmhd()),
        };
        let minf = boxed(
            b"minf",
            vec![],
            vec![media_header, boxes::dinf(), self.stbl(track)],
        );
        let mdia = boxed(
            b"mdia",
            vec![],
            vec![
                boxes::mdhd(
                    self.creation_time,
                    track.timescale,
                    into_timescale(end, track.timescale),
                    &track.info.metadata.language,
                ),
                boxes::hdlr(self.quicktime, handler_type, handler_name, &[0; 4]),
                minf,
            ],
        );
        let children: Vec<Node> = vec![
            tkhd,
            mdia,
            track
                .info
                .metadata
                .name
                .as_deref()
                .map(boxes::track_name)
                .into(),
        ];
        boxed(b"trak", vec![], children)
    }

    fn stbl(&self, track: &IsoTrack) -> Node {
        let fragmented = self.fragmented();
        let mut children = vec![
            boxes::stsd(track.sample_entry.clone()),
            boxes::stts(&track.time_to_sample),
        ];
        if boxes::needs_ctts(&track.composition_offsets) {
            children.push(boxes::ctts(&track.composition_offsets));
        }
        children.push(boxes::stsc(&track.sample_to_chunk));

        let stsz = match track.pcm_frame_size() {
            Some(frame_size) => boxes::stsz_constant(
                frame_size,
                track.time_to_sample.iter().map(|e| e.sample_count).sum(),
            ),
            None if fragmented => boxes::stsz_variable(core::iter::empty()),
            None => boxes::stsz_variable(track.samples.iter().map(|s| s.size)),
        };
        children.push(stsz);

        let offsets: Vec<u64> = if fragmented {
            Vec::new()
        } else {
            track.chunks.iter().map(|c| c.offset).collect()
        };
        children.push(boxes::chunk_offsets(&offsets));

        if !fragmented && track.samples.iter().any(|s| !s.is_key) {
            let keys: Vec<u32> = track
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_key)
                .map(|(i, _)| i as u32)
                .collect();
            children.push(boxes::stss(&keys));
        }
        boxed(b"stbl", vec![], children)
    }

    /// PCM で前のサンプルとの間に隙間がある場合に無音のサンプルで埋める
    fn pad_with_silence(&mut self, index: usize, until: f64) -> Result<(), MuxError> {
        let track = &self.tracks[index];
        let (Some(frame_size), TrackConfig::Audio {
            pcm: Some(pcm),
            config,
            ..
        }) = (track.pcm_frame_size(), &track.config)
        else {
            return Ok(());
        };
        let last_end = track
            .samples
            .last()
            .map_or(0.0, |s| s.timestamp + s.duration);
        let frames = into_timescale(until - last_end, track.timescale);
        if frames == 0 {
            return Ok(());
        }
        let data = vec![pcm.silent_value(); frames as usize * frame_size as usize];
        let duration = frames as f64 / config.sample_rate as f64;
        tracing::debug!(track_id = track.info.id, frames, "padding PCM gap with silence");
        let sample = self.new_sample(index, data, last_end, duration, true);
        self.register_sample(index, sample)
    }

    fn register_cues(&mut self, index: usize, until: f64) -> Result<(), MuxError> {
        let TrackConfig::Subtitle { splitter } = &mut self.tracks[index].config else {
            return Ok(());
        };
        for s in splitter.drain_until(until)? {
            let sample = self.new_sample(index, s.data, s.timestamp, s.duration, true);
            self.register_sample(index, sample)?;
        }
        Ok(())
    }
}

impl Muxer for IsoMuxer {
    fn start(&mut self) -> Result<(), MuxError> {
        if self.fragmented() {
            self.writer.set_ensure_monotonicity(true);
        }
        let kind = if self.quicktime {
            FtypKind::QuickTime
        } else if self.fragmented() {
            FtypKind::Fragmented
        } else {
            FtypKind::Standard {
                holds_avc: self
                    .infos
                    .iter()
                    .any(|i| i.codec == TrackCodec::Video(VideoCodec::Avc)),
            }
        };

        let on_ftyp = self.options.on_ftyp.clone();
        if on_ftyp.is_some() {
            self.writer.start_tracking_writes();
        }
        boxes::ftyp(kind).write_to(&mut self.writer)?;
        if let Some(callback) = on_ftyp {
            let (data, start) = self.writer.stop_tracking_writes();
            callback(&data, start);
        }
        self.ftyp_size = self.writer.pos();

        if self.options.fast_start == FastStart::None {
            if self.options.on_mdat.is_some() {
                self.writer.start_tracking_writes();
            }
            self.mdat_pos = Some(self.writer.pos());
            self.writer
                .write(&boxes::box_header(b"mdat", LARGE_BOX_HEADER_SIZE, true))?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn add_video_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<VideoDecoderConfig>,
    ) -> Result<(), MuxError> {
        let index = self.video_track(track_id, config, &packet.data)?;
        let length_prefix = matches!(
            self.tracks[index].config,
            TrackConfig::Video {
                length_prefix: true,
                ..
            }
        );
        let is_key = packet.is_key();
        let data = if length_prefix {
            annex_b_to_length_prefixed(&packet.data)?
        } else {
            packet.data
        };
        let sample = self.new_sample(index, data, packet.timestamp, packet.duration, is_key);
        self.register_sample(index, sample)
    }

    fn add_audio_packet(
        &mut self,
        track_id: u32,
        packet: EncodedPacket,
        config: Option<AudioDecoderConfig>,
    ) -> Result<(), MuxError> {
        let index = self.audio_track(track_id, config)?;
        let mut duration = packet.duration;
        if let Some(frame_size) = self.tracks[index].pcm_frame_size() {
            if packet.data.len() % frame_size as usize != 0 {
                return Err(MuxError::validation(
                    "packet.data",
                    format!(
                        "PCM packet size ({}) must be a multiple of the frame size ({frame_size})",
                        packet.data.len()
                    ),
                ));
            }
            self.pad_with_silence(index, packet.timestamp)?;
            let frames = packet.data.len() / frame_size as usize;
            duration = frames as f64 / self.tracks[index].timescale as f64;
        }
        let is_key = packet.is_key();
        let sample = self.new_sample(index, packet.data, packet.timestamp, duration, is_key);
        self.register_sample(index, sample)
    }

    fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        cue: SubtitleCue,
        config: Option<SubtitleConfig>,
    ) -> Result<(), MuxError> {
        let index = self.subtitle_track(track_id, config)?;
        let until = cue.timestamp;
        if let TrackConfig::Subtitle { splitter } = &mut self.tracks[index].config {
            splitter.push(cue);
        }
        self.register_cues(index, until)
    }

    fn close_track(&mut self, track_id: u32) -> Result<(), MuxError> {
        if let Some(closed) = self.closed.get_mut(track_id as usize - 1) {
            *closed = true;
        }
        if let Some(index) = self.track_index(track_id) {
            self.register_cues(index, f64::INFINITY)?;
            self.process_timestamps(index, None)?;
            if !self.fragmented() {
                self.finalize_current_chunk(index);
            }
        }
        if self.fragmented() {
            self.interleave(false)
        } else if self.mdat_pos.is_some() || self.options.fast_start == FastStart::InMemory {
            self.write_finished_chunks(false)
        } else {
            Ok(())
        }
    }

    fn finalize(&mut self) -> Result<(), MuxError> {
        for index in 0..self.tracks.len() {
            self.register_cues(index, f64::INFINITY)?;
        }
        if self.options.fast_start == FastStart::Reserve && self.mdat_pos.is_none() {
            self.create_reservation()?;
        }

        if self.fragmented() {
            self.interleave(true)?;
            for index in 0..self.tracks.len() {
                self.process_timestamps(index, None)?;
            }
            if self.tracks.iter().any(|t| t.current_chunk.is_some()) {
                self.finalize_fragment(false)?;
            } else if self.next_fragment_number == 1 {
                self.write_moov()?;
            }
            self.write_mfra()?;
        } else {
            for index in 0..self.tracks.len() {
                self.process_timestamps(index, None)?;
                self.finalize_current_chunk(index);
            }
            self.write_finished_chunks(true)?;
            match self.options.fast_start {
                FastStart::InMemory => self.finalize_in_memory()?,
                FastStart::Reserve => self.finalize_reserved()?,
                FastStart::None | FastStart::Fragmented => {
                    let mdat_pos = self
                        .mdat_pos
                        .ok_or_else(|| Error::internal("mdat placeholder is missing"))?;
                    self.patch_mdat_header(mdat_pos)?;
                    self.finish_mdat_tracking();
                    self.write_moov()?;
                }
            }
        }
        self.writer.finalize()?;
        Ok(())
    }

    fn cancel(&mut self) -> Result<usize, MuxError> {
        let discarded = self
            .tracks
            .iter()
            .map(|t| {
                let samples = t.samples.iter().filter(|s| s.data.is_some()).count();
                let cues = match &t.config {
                    TrackConfig::Subtitle { splitter } => splitter.queued_len(),
                    _ => 0,
                };
                samples + cues
            })
            .sum();
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

/// stts の末尾を更新する
///
/// 直前のサンプルの尺は仮に自身の duration としてあったので、実際の復号時刻の差分 `delta` で置き換えてから、
/// 今回のサンプルを `duration` で追加する
fn push_time_to_sample(
    table: &mut Vec<TimeToSampleEntry>,
    delta: u32,
    duration: u32,
) -> Result<(), MuxError> {
    let mut last = table
        .len()
        .checked_sub(1)
        .ok_or_else(|| Error::internal("Time-to-sample table is empty"))?;
    if table[last].sample_count == 1 {
        table[last].sample_delta = delta;
        if last >= 1 && table[last - 1].sample_delta == delta {
            table[last - 1].sample_count += 1;
            table.pop();
            last -= 1;
        }
    } else if table[last].sample_delta != delta {
        table[last].sample_count -= 1;
        table.push(TimeToSampleEntry {
            sample_count: 1,
            sample_delta: delta,
        });
        last += 1;
    }

    if table[last].sample_delta == duration {
        table[last].sample_count += 1;
    } else {
        table.push(TimeToSampleEntry {
            sample_count: 1,
            sample_delta: duration,
        });
    }
    Ok(())
}

fn video_sample_entry(config: &VideoDecoderConfig) -> Result<Node, MuxError> {
    let color_space = config.color_space.as_ref();
    let description = || config.description.clone().unwrap_or_default();
    let (box_type, codec_config) = match config.codec {
        VideoCodec::Avc => (b"avc1", boxed(b"avcC", description(), vec![])),
        VideoCodec::Hevc => (b"hvc1", boxed(b"hvcC", description(), vec![])),
        VideoCodec::Vp8 => (
            b"vp08",
            full_box(
                b"vpcC",
                1,
                0,
                VpCodecConfig::vp8(color_space).to_vpcc_payload(),
                vec![],
            ),
        ),
        VideoCodec::Vp9 => {
            let vp = VpCodecConfig::from_vp9_codec_string(&config.codec_string, color_space)
                .map_err(|e| MuxError::validation("config.codec_string", e.reason))?;
            (b"vp09", full_box(b"vpcC", 1, 0, vp.to_vpcc_payload(), vec![]))
        }
        VideoCodec::Av1 => {
            let av1c = av1_config_from_codec_string(&config.codec_string)
                .map_err(|e| MuxError::validation("config.codec_string", e.reason))?;
            (b"av01", boxed(b"av1C", av1c.to_vec(), vec![]))
        }
    };
    let children: Vec<Node> = vec![codec_config, color_space.and_then(boxes::colr).into()];
    Ok(boxes::video_sample_entry(
        box_type,
        config.coded_width,
        config.coded_height,
        children,
    ))
}

/// QuickTime での PCM のサンプルエントリー種別
fn quicktime_pcm_type(pcm: PcmFormat) -> &'static [u8; 4] {
    match (pcm.data_type, pcm.sample_size, pcm.little_endian) {
        (PcmDataType::Ulaw, ..) => b"ulaw",
        (PcmDataType::Alaw, ..) => b"alaw",
        (PcmDataType::Unsigned, ..) => b"raw ",
        (PcmDataType::Signed, 2, true) => b"sowt",
        (PcmDataType::Signed, 3, _) => b"in24",
        (PcmDataType::Signed, 4, _) => b"in32",
        (PcmDataType::Signed, ..) => b"twos",
        (PcmDataType::Float, 8, _) => b"fl64",
        (PcmDataType::Float, ..) => b"fl32",
    }
}

fn audio_sample_entry(config: &AudioDecoderConfig, quicktime: bool) -> Result<Node, MuxError> {
    let mut entry = SoundEntry {
        channels: config.number_of_channels as u16,
        sample_rate: config.sample_rate,
        sample_size_bits: 16,
        quicktime_v1: false,
    };
    let description = config.description.as_deref();
    let invalid = |e: Error| MuxError::validation("config.description", e.reason);

    let (box_type, children): (&[u8; 4], Vec<Node>) = match config.codec {
        AudioCodec::Aac => (b"mp4a", vec![boxes::esds(0x40, description)]),
        AudioCodec::Mp3 => (b"mp4a", vec![boxes::esds(0x6B, None)]),
        AudioCodec::Vorbis => (b"mp4a", vec![boxes::esds(0xDD, description)]),
        AudioCodec::Opus => {
            let head = parse_opus_head(description.unwrap_or_default()).map_err(invalid)?;
            entry.sample_rate = 48000;
            (b"Opus", vec![boxed(b"dOps", head.to_dops_payload(), vec![])])
        }
        AudioCodec::Flac => {
            let header = parse_flac_header(description.unwrap_or_default()).map_err(invalid)?;
            (
                b"fLaC",
                vec![full_box(b"dfLa", 0, 0, header.to_dfla_payload(), vec![])],
            )
        }
        AudioCodec::Pcm(pcm) => {
            let bits = pcm.sample_size * 8;
            entry.sample_size_bits = bits as u16;
            if quicktime {
                let box_type = quicktime_pcm_type(pcm);
                entry.quicktime_v1 = bits > 16;
                let children = if entry.quicktime_v1 {
                    vec![boxes::wave(box_type, pcm.little_endian)]
                } else {
                    Vec::new()
                };
                (box_type, children)
            } else {
                let box_type = if pcm.data_type == PcmDataType::Float {
                    b"fpcm"
                } else {
                    b"ipcm"
                };
                (box_type, vec![boxes::pcmc(pcm.little_endian, bits)])
            }
        }
    };
    Ok(boxes::sound_sample_entry(box_type, &entry, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{PacketType, TrackMetadata},
        sink::MemorySink,
    };

    fn muxer(fast_start: FastStart, codecs: &[TrackCodec]) -> IsoMuxer {
        let infos = codecs
            .iter()
            .enumerate()
            .map(|(i, &codec)| TrackInfo {
                id: i as u32 + 1,
                codec,
                metadata: TrackMetadata {
                    maximum_packet_count: Some(100),
                    ..TrackMetadata::default()
                },
            })
            .collect();
        let options = IsoOptions {
            fast_start,
            ..IsoOptions::default()
        };
        let writer = Writer::new(Box::new(MemorySink::new()));
        IsoMuxer::new(writer, infos, MetadataTags::default(), options, false)
    }

    fn vp8_config() -> VideoDecoderConfig {
        VideoDecoderConfig::new("vp8", 320, 240).unwrap()
    }

    fn packet(ts: f64, key: bool) -> EncodedPacket {
        let ty = if key { PacketType::Key } else { PacketType::Delta };
        EncodedPacket::new(vec![0; 10], ty, ts, 0.1)
    }

    #[test]
    fn frame_rate_timescales() {
        assert_eq!(timescale_for_frame_rate(30.0), 30);
        assert_eq!(timescale_for_frame_rate(25.0), 25);
        assert_eq!(timescale_for_frame_rate(DEFAULT_VIDEO_TIMESCALE_RATE), 57600);
    }

    #[test]
    fn time_to_sample_merging() {
        let mut table = vec![TimeToSampleEntry {
            sample_count: 1,
            sample_delta: 10,
        }];
        push_time_to_sample(&mut table, 10, 10).unwrap();
        push_time_to_sample(&mut table, 10, 10).unwrap();
        assert_eq!(
            table,
            [TimeToSampleEntry {
                sample_count: 3,
                sample_delta: 10
            }]
        );
        // 最後のサンプルの実際の間隔が異なる
        push_time_to_sample(&mut table, 20, 10).unwrap();
        assert_eq!(
            table,
            [
                TimeToSampleEntry {
                    sample_count: 2,
                    sample_delta: 10
                },
                TimeToSampleEntry {
                    sample_count: 1,
                    sample_delta: 20
                },
                TimeToSampleEntry {
                    sample_count: 1,
                    sample_delta: 10
                },
            ]
        );
    }

    #[test]
    fn reordered_frames_produce_composition_offsets() {
        let mut m = muxer(FastStart::None, &[TrackCodec::Video(VideoCodec::Vp8)]);
        m.start().unwrap();
        m.add_video_packet(1, packet(0.0, true), Some(vp8_config())).unwrap();
        m.add_video_packet(1, packet(0.2, false), None).unwrap();
        m.add_video_packet(1, packet(0.1, false), None).unwrap();
        m.add_video_packet(1, packet(0.3, true), None).unwrap();
        m.close_track(1).unwrap();
        m.finalize().unwrap();

        let track = &m.tracks[0];
        let decode: Vec<f64> = track.samples.iter().map(|s| s.decode_timestamp).collect();
        assert_eq!(decode, [0.0, 0.1, 0.2, 0.3]);
        assert_eq!(track.timescale, 57600);
        let offsets: Vec<i32> = track
            .composition_offsets
            .iter()
            .flat_map(|e| core::iter::repeat_n(e.sample_offset, e.sample_count as usize))
            .collect();
        assert_eq!(offsets, [0, 5760, -5760, 0]);
        assert!(m.take_buffer().is_some());
    }

    #[test]
    fn reserve_mode_enforces_packet_count() {
        let mut m = muxer(FastStart::Reserve, &[TrackCodec::Video(VideoCodec::Vp8)]);
        m.infos[0].metadata.maximum_packet_count = Some(2);
        m.start().unwrap();
        m.add_video_packet(1, packet(0.0, true), Some(vp8_config())).unwrap();
        m.add_video_packet(1, packet(0.1, false), None).unwrap();
        assert!(matches!(
            m.add_video_packet(1, packet(0.2, false), None),
            Err(MuxError::ReservedPacketCountExceeded {
                track_id: 1,
                maximum: 2
            })
        ));
    }

    #[test]
    fn fragments_wait_for_all_tracks() {
        let mut m = muxer(
            FastStart::Fragmented,
            &[
                TrackCodec::Video(VideoCodec::Vp8),
                TrackCodec::Video(VideoCodec::Vp8),
            ],
        );
        m.start().unwrap();
        m.add_video_packet(1, packet(0.0, true), Some(vp8_config())).unwrap();
        // 二番目のトラックがまだ何も受け取っていないのでインターリーブは進まない
        assert!(m.tracks[0].current_chunk.is_none());
        m.add_video_packet(2, packet(0.0, true), Some(vp8_config())).unwrap();
        assert!(m.tracks[0].current_chunk.is_some());
        m.finalize().unwrap();
        assert_eq!(m.next_fragment_number, 2);
    }

    #[test]
    fn chunks_are_written_in_timestamp_order() {
        let mut m = muxer(
            FastStart::None,
            &[
                TrackCodec::Video(VideoCodec::Vp8),
                TrackCodec::Video(VideoCodec::Vp8),
            ],
        );
        m.start().unwrap();
        // 一方のトラックを全て送ってから、もう一方を送る
        for track_id in [1, 2] {
            for i in 0..20 {
                let config = (i == 0).then(vp8_config);
                m.add_video_packet(track_id, packet(i as f64 * 0.1, true), config)
                    .unwrap();
            }
        }
        m.close_track(1).unwrap();
        m.close_track(2).unwrap();
        m.finalize().unwrap();

        let written: Vec<(u32, &Chunk)> = m
            .finalized_chunks
            .iter()
            .map(|&(id, i)| (id, &m.tracks[id as usize - 1].chunks[i]))
            .collect();
        assert_eq!(written.len(), 8);
        let ids: Vec<u32> = written.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, [1, 2, 1, 2, 1, 2, 1, 2]);
        assert!(
            written
                .windows(2)
                .all(|w| w[0].1.start_timestamp <= w[1].1.start_timestamp
                    && w[0].1.offset < w[1].1.offset)
        );
    }

    #[test]
    fn random_access_entries_point_at_their_own_traf() {
        let mut m = muxer(
            FastStart::Fragmented,
            &[
                TrackCodec::Video(VideoCodec::Vp8),
                TrackCodec::Video(VideoCodec::Vp8),
            ],
        );
        m.options.minimum_fragment_duration = 1.0;
        m.start().unwrap();
        m.add_video_packet(1, packet(0.0, true), Some(vp8_config())).unwrap();
        m.add_video_packet(2, packet(0.0, true), Some(vp8_config())).unwrap();
        m.close_track(1).unwrap();
        for i in 1..=20 {
            m.add_video_packet(2, packet(i as f64 * 0.1, i == 20), None)
                .unwrap();
        }
        m.close_track(2).unwrap();
        m.finalize().unwrap();

        let traf_numbers =
            |j: usize| -> Vec<u32> { m.tracks[j].chunks.iter().map(|c| c.traf_number).collect() };
        assert_eq!(traf_numbers(0), [1]);
        // 二つ目の moof にはトラック 2 の traf しかない
        assert_eq!(traf_numbers(1), [2, 1]);
    }
}
