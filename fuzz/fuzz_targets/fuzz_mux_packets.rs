#![no_main]

use libfuzzer_sys::fuzz_target;
use shiguredo_mux::{
    metadata::{
        AudioCodec, AudioDecoderConfig, EncodedPacket, PacketType, TrackMetadata, VideoCodec,
        VideoDecoderConfig,
    },
    mux::{FastStart, IsoOptions, MatroskaOptions, Output, OutputFormat},
    sink::Target,
};

// 先頭 1 バイトで出力形式を選び、残りは「ヘッダ 1 バイト + 本体」の繰り返しとしてパケット列に分解する
// ヘッダの最上位ビットが音声 / 映像の区別、下位 7 ビットが本体の長さ
fuzz_target!(|data: &[u8]| {
    let Some((&selector, mut rest)) = data.split_first() else {
        return;
    };
    let format = match selector % 5 {
        0 => OutputFormat::Mp4(IsoOptions::default()),
        1 => OutputFormat::Mp4(IsoOptions {
            fast_start: FastStart::Fragmented,
            minimum_fragment_duration: 0.0,
            ..IsoOptions::default()
        }),
        2 => OutputFormat::Mov(IsoOptions {
            fast_start: FastStart::InMemory,
            ..IsoOptions::default()
        }),
        3 => OutputFormat::Mkv(MatroskaOptions::default()),
        _ => OutputFormat::Mkv(MatroskaOptions {
            append_only: true,
            ..MatroskaOptions::default()
        }),
    };
    let Ok(output) = Output::new(format, Target::memory()) else {
        return;
    };
    let Ok(video) = output.add_video_track(VideoCodec::Avc, TrackMetadata::default()) else {
        return;
    };
    let Ok(audio) = output.add_audio_track(AudioCodec::Opus, TrackMetadata::default()) else {
        return;
    };
    if output.start().is_err() {
        return;
    }

    let mut index = 0usize;
    while let Some((&header, tail)) = rest.split_first() {
        let len = (header & 0x7F) as usize;
        let (body, next) = tail.split_at(len.min(tail.len()));
        rest = next;
        let timestamp = index as f64 * 0.02;
        let result = if header & 0x80 == 0 {
            let config = (index == 0).then(|| VideoDecoderConfig::new("avc1.42001f", 320, 240));
            let config = match config.transpose() {
                Ok(config) => config,
                Err(_) => return,
            };
            let ty = if index % 10 == 0 {
                PacketType::Key
            } else {
                PacketType::Delta
            };
            output.add_video_packet(
                video,
                EncodedPacket::new(body.to_vec(), ty, timestamp, 0.02),
                config,
            )
        } else {
            let config = AudioDecoderConfig::new("opus", 48000, 2).ok();
            output.add_audio_packet(
                audio,
                EncodedPacket::new(body.to_vec(), PacketType::Key, timestamp, 0.02),
                config,
            )
        };
        if result.is_err() {
            return;
        }
        index += 1;
    }
    if output.finalize().is_ok() {
        let _ = output.take_buffer();
    }
});
