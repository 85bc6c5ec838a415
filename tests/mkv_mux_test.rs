//! MKV / WebM 出力の結合テスト
mod common;

use std::sync::{Arc, Mutex};

use common::{ParsedMatroska, ids, parse_matroska};
use shiguredo_mux::{
    metadata::{
        AttachedImage, AttachedImageKind, AudioCodec, AudioDecoderConfig, EncodedPacket,
        MetadataTags, PacketType, RawTagValue, SubtitleCodec, SubtitleConfig, SubtitleCue,
        TrackMetadata, VideoCodec, VideoDecoderConfig,
    },
    mux::{MatroskaOptions, MuxError, Output, OutputFormat, OutputState},
    sink::Target,
};

fn vp8_config() -> VideoDecoderConfig {
    VideoDecoderConfig::new("vp8", 320, 240).expect("valid config")
}

fn opus_config() -> AudioDecoderConfig {
    AudioDecoderConfig::new("opus", 48000, 2).expect("valid config")
}

fn packet(data: Vec<u8>, key: bool, timestamp: f64, duration: f64) -> EncodedPacket {
    let ty = if key { PacketType::Key } else { PacketType::Delta };
    EncodedPacket::new(data, ty, timestamp, duration)
}

fn frame(track: u8, i: usize) -> Vec<u8> {
    let mut data = vec![track; 4 + i % 11];
    data[0] = i as u8;
    data
}

fn webm(options: MatroskaOptions) -> Output {
    Output::new(OutputFormat::WebM(options), Target::memory()).expect("output")
}

/// 映像 (10fps, 1 秒ごとにキー) と Opus 音声 (20ms) を 3 秒分、時刻順に投入する
fn write_video_and_audio(output: &Output) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let video = output
        .add_video_track(VideoCodec::Vp8, TrackMetadata::default())
        .expect("video track");
    let audio = output
        .add_audio_track(AudioCodec::Opus, TrackMetadata::default())
        .expect("audio track");
    output.start().expect("start");

    let mut events: Vec<(f64, bool, usize)> = (0..30)
        .map(|i| (i as f64 * 0.1, true, i))
        .chain((0..150).map(|i| (i as f64 * 0.02, false, i)))
        .collect();
    events.sort_by(|a, b| a.0.total_cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut video_data = Vec::new();
    let mut audio_data = Vec::new();
    for (timestamp, is_video, i) in events {
        if is_video {
            let data = frame(1, i);
            video_data.push(data.clone());
            let config = (i == 0).then(vp8_config);
            output
                .add_video_packet(video, packet(data, i % 10 == 0, timestamp, 0.1), config)
                .expect("video packet");
        } else {
            let data = frame(2, i);
            audio_data.push(data.clone());
            let config = (i == 0).then(opus_config);
            output
                .add_audio_packet(audio, packet(data, true, timestamp, 0.02), config)
                .expect("audio packet");
        }
    }
    (video_data, audio_data)
}

fn track_data(file: &ParsedMatroska<'_>, track_number: u64) -> Vec<Vec<u8>> {
    file.blocks()
        .into_iter()
        .filter(|b| b.track_number == track_number)
        .map(|b| b.data)
        .collect()
}

#[test]
fn webm_output_is_seekable() {
    let output = webm(MatroskaOptions::default());
    let (video_data, audio_data) = write_video_and_audio(&output);
    assert_eq!(
        output.mime_type().as_deref(),
        Some("video/webm; codecs=\"vp8, opus\"")
    );
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    assert_eq!(file.doc_type, "webm");
    assert_eq!(
        file.segment.size,
        Some((bytes.len() - file.segment.data_offset) as u64)
    );

    let info = file.element(ids::INFO).expect("Info");
    assert_eq!(info.child(ids::DURATION).expect("Duration").float(), 3000.0);

    let tracks = file.element(ids::TRACKS).expect("Tracks");
    let entries = tracks.all(ids::TRACK_ENTRY);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].child(ids::CODEC_ID).expect("CodecID").string(), "V_VP8");
    assert_eq!(entries[1].child(ids::CODEC_ID).expect("CodecID").string(), "A_OPUS");
    let private = entries[1].child(ids::CODEC_PRIVATE).expect("CodecPrivate");
    assert!(private.payload.starts_with(b"OpusHead"));

    assert_eq!(track_data(&file, 1), video_data);
    assert_eq!(track_data(&file, 2), audio_data);

    // ブロックは時刻順にインターリーブされる
    let blocks = file.blocks();
    assert!(blocks.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));

    // クラスターは全トラックのキーフレームから始まる
    assert!(file.clusters.len() >= 2);
    for cluster in &file.clusters {
        let first_video = cluster
            .blocks
            .iter()
            .find(|b| b.track_number == 1)
            .expect("video block in cluster");
        assert!(first_video.is_key);
        assert_eq!(first_video.timestamp_ms, cluster.timestamp_ms);
    }

    // キューはクラスターを指す
    let cluster_offsets: Vec<usize> = file.clusters.iter().map(|c| c.offset).collect();
    let cues = file.element(ids::CUES).expect("Cues");
    let points = cues.all(ids::CUE_POINT);
    assert!(!points.is_empty());
    for point in points {
        let time = point.child(ids::CUE_TIME).expect("CueTime").uint() as i64;
        for positions in point.all(ids::CUE_TRACK_POSITIONS) {
            let position = positions
                .child(ids::CUE_CLUSTER_POSITION)
                .expect("CueClusterPosition")
                .uint() as usize;
            let offset = file.segment.data_offset + position;
            let cluster = file
                .clusters
                .iter()
                .find(|c| c.offset == offset)
                .unwrap_or_else(|| panic!("no cluster at {offset} ({cluster_offsets:?})"));
            assert!(time >= cluster.timestamp_ms);
        }
    }

    // シークヘッドの位置は実際の要素を指す
    let seek_head = file.element(ids::SEEK_HEAD).expect("SeekHead");
    let seeks = seek_head.all(ids::SEEK);
    assert_eq!(seeks.len(), 3);
    for seek in seeks {
        let id = seek.child(ids::SEEK_ID).expect("SeekID").uint() as u32;
        let position = seek.child(ids::SEEK_POSITION).expect("SeekPosition").uint() as usize;
        let element = file.element(id).expect("sought element");
        assert_eq!(element.offset, file.segment.data_offset + position);
    }
}

#[test]
fn append_only_output_uses_unknown_sizes() {
    let output = webm(MatroskaOptions {
        append_only: true,
        ..MatroskaOptions::default()
    });
    let (video_data, audio_data) = write_video_and_audio(&output);
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    assert_eq!(file.segment.size, None);
    assert!(file.element(ids::SEEK_HEAD).is_none());
    let info = file.element(ids::INFO).expect("Info");
    assert!(info.child(ids::DURATION).is_none());
    assert!(file.element(ids::CUES).is_some());
    assert!(
        file.top
            .iter()
            .filter(|e| e.id == ids::CLUSTER)
            .all(|e| e.size.is_none())
    );
    assert_eq!(track_data(&file, 1), video_data);
    assert_eq!(track_data(&file, 2), audio_data);
}

#[test]
fn cluster_callback_reports_each_cluster() {
    let clusters: Arc<Mutex<Vec<(u64, f64, usize)>>> = Arc::default();
    let recorded = clusters.clone();
    let output = webm(MatroskaOptions {
        on_cluster: Some(Arc::new(move |data, position, timestamp| {
            recorded
                .lock()
                .expect("lock")
                .push((position, timestamp, data.len()));
        })),
        ..MatroskaOptions::default()
    });
    write_video_and_audio(&output);
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    let recorded = clusters.lock().expect("lock").clone();
    assert_eq!(recorded.len(), file.clusters.len());
    for ((position, timestamp, _), cluster) in recorded.iter().zip(&file.clusters) {
        assert_eq!(*position as usize, cluster.offset);
        assert_eq!((timestamp * 1000.0).round() as i64, cluster.timestamp_ms);
    }
    let cluster_elements: Vec<_> = file.top.iter().filter(|e| e.id == ids::CLUSTER).collect();
    for ((_, _, len), element) in recorded.iter().zip(cluster_elements) {
        let size = element.size.expect("cluster size") as usize;
        assert_eq!(*len, element.data_offset - element.offset + size);
    }
}

#[test]
fn subtitle_cues_are_written_as_block_groups() {
    let output = Output::new(
        OutputFormat::Mkv(MatroskaOptions::default()),
        Target::memory(),
    )
    .expect("output");
    let subtitles = output
        .add_subtitle_track(SubtitleCodec::WebVtt, TrackMetadata::default())
        .expect("subtitle track");
    output.start().expect("start");

    let mut first = SubtitleCue::new("hello <00:01.500>world", 1.0, 2.0);
    first.settings = Some("align:start".to_owned());
    first.identifier = Some("c1".to_owned());
    let config = SubtitleConfig::new("WEBVTT\n\nSTYLE\n::cue { color: red }").expect("config");
    output
        .add_subtitle_cue(subtitles, first, Some(config))
        .expect("cue");
    output
        .add_subtitle_cue(subtitles, SubtitleCue::new("plain", 4.0, 1.0), None)
        .expect("cue");
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    assert_eq!(file.doc_type, "matroska");
    let entry = file
        .element(ids::TRACKS)
        .expect("Tracks")
        .child(ids::TRACK_ENTRY)
        .expect("TrackEntry");
    assert_eq!(
        entry.child(ids::CODEC_ID).expect("CodecID").string(),
        "S_TEXT/WEBVTT"
    );
    assert!(
        entry
            .child(ids::CODEC_PRIVATE)
            .expect("CodecPrivate")
            .payload
            .starts_with(b"WEBVTT")
    );

    let blocks = file.blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].timestamp_ms, 1000);
    assert_eq!(blocks[0].duration_ms, Some(2000));
    assert_eq!(blocks[0].data, b"hello <00:00:00.500>world");
    assert_eq!(
        blocks[0].additional.as_deref(),
        Some(b"align:start\nc1\n".as_slice())
    );
    assert_eq!(blocks[1].timestamp_ms, 4000);
    assert_eq!(blocks[1].duration_ms, Some(1000));
    assert_eq!(blocks[1].data, b"plain");
    assert_eq!(blocks[1].additional, None);
}

#[test]
fn alpha_is_stored_as_block_additions() {
    let output = webm(MatroskaOptions::default());
    let video = output
        .add_video_track(VideoCodec::Vp8, TrackMetadata::default())
        .expect("video track");
    output.start().expect("start");
    output
        .add_video_packet(
            video,
            packet(vec![1, 2, 3], true, 0.0, 0.1).with_alpha(vec![9, 9]),
            Some(vp8_config()),
        )
        .expect("packet");
    output
        .add_video_packet(
            video,
            packet(vec![4, 5], false, 0.1, 0.1).with_alpha(vec![8]),
            None,
        )
        .expect("packet");
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    let video_element = file
        .element(ids::TRACKS)
        .and_then(|t| t.child(ids::TRACK_ENTRY))
        .and_then(|e| e.child(ids::VIDEO))
        .expect("Video");
    assert_eq!(
        video_element.child(ids::ALPHA_MODE).expect("AlphaMode").uint(),
        1
    );

    let blocks = file.blocks();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].is_key);
    assert_eq!(blocks[0].additional.as_deref(), Some([9u8, 9].as_slice()));
    assert!(!blocks[1].is_key);
    assert_eq!(blocks[1].data, [4, 5]);
    assert_eq!(blocks[1].additional.as_deref(), Some([8u8].as_slice()));
}

#[test]
fn tags_and_attachments_are_written() {
    let output = Output::new(
        OutputFormat::Mkv(MatroskaOptions::default()),
        Target::memory(),
    )
    .expect("output");
    let video = output
        .add_video_track(VideoCodec::Vp8, TrackMetadata::default())
        .expect("video track");
    output
        .set_metadata_tags(MetadataTags {
            title: Some("Title".to_owned()),
            artist: Some("Artist".to_owned()),
            images: vec![AttachedImage {
                data: vec![0xFF, 0xD8, 0xFF],
                mime_type: "image/jpeg".to_owned(),
                kind: AttachedImageKind::CoverFront,
                name: None,
                description: None,
            }],
            raw: vec![("ENCODER".to_owned(), RawTagValue::Text("test".to_owned()))],
            ..MetadataTags::default()
        })
        .expect("tags");
    output.start().expect("start");
    output
        .add_video_packet(video, packet(vec![1], true, 0.0, 0.1), Some(vp8_config()))
        .expect("packet");
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);

    let tag = file
        .element(ids::TAGS)
        .and_then(|t| t.child(ids::TAG))
        .expect("Tag");
    let pairs: Vec<(String, String)> = tag
        .all(ids::SIMPLE_TAG)
        .iter()
        .map(|s| {
            (
                s.child(ids::TAG_NAME).expect("TagName").string(),
                s.child(ids::TAG_STRING).expect("TagString").string(),
            )
        })
        .collect();
    assert_eq!(
        pairs,
        [
            ("TITLE".to_owned(), "Title".to_owned()),
            ("ARTIST".to_owned(), "Artist".to_owned()),
            ("ENCODER".to_owned(), "test".to_owned()),
        ]
    );

    let file_name = file
        .element(ids::ATTACHMENTS)
        .and_then(|a| a.child(ids::ATTACHED_FILE))
        .and_then(|f| f.child(ids::FILE_NAME))
        .expect("FileName");
    assert_eq!(file_name.string(), "cover.jpg");

    let seeks = file.element(ids::SEEK_HEAD).expect("SeekHead").all(ids::SEEK);
    assert_eq!(seeks.len(), 5);
}

#[test]
fn webm_rejects_codecs_outside_its_profile() {
    let output = webm(MatroskaOptions::default());
    let result = output.add_audio_track(AudioCodec::Aac, TrackMetadata::default());
    assert!(matches!(
        result,
        Err(MuxError::UnsupportedCodec {
            format: "WebM",
            suggestion: Some("MP4"),
            ..
        })
    ));
    let result = output.add_video_track(VideoCodec::Avc, TrackMetadata::default());
    assert!(matches!(result, Err(MuxError::UnsupportedCodec { .. })));
    assert_eq!(output.state(), OutputState::Pending);
}

#[test]
fn segment_waits_for_every_track() {
    let output = webm(MatroskaOptions::default());
    let video = output
        .add_video_track(VideoCodec::Vp8, TrackMetadata::default())
        .expect("video track");
    let audio = output
        .add_audio_track(AudioCodec::Opus, TrackMetadata::default())
        .expect("audio track");
    output.start().expect("start");
    for i in 0..5 {
        let config = (i == 0).then(vp8_config);
        output
            .add_video_packet(video, packet(frame(1, i), i == 0, i as f64 * 0.1, 0.1), config)
            .expect("packet");
    }
    assert!(output.mime_type().is_none());

    // 音声トラックは一度もパケットを受け取らずに閉じられる
    output.close_track(audio).expect("close");
    assert_eq!(
        output.mime_type().as_deref(),
        Some("video/webm; codecs=\"vp8\"")
    );
    output.finalize().expect("finalize");
    let bytes = output.take_buffer().expect("buffer");
    let file = parse_matroska(&bytes);
    let entries = file.element(ids::TRACKS).expect("Tracks").all(ids::TRACK_ENTRY);
    assert_eq!(entries.len(), 1);
    assert_eq!(file.blocks().len(), 5);
}
