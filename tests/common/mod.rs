//! 出力されたファイルを検証するための最小限の ISO BMFF / EBML リーダー
#![allow(dead_code)]

pub fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

pub fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().expect("4 bytes"))
}

pub fn u64_at(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(data[offset..offset + 8].try_into().expect("8 bytes"))
}

/// ISO BMFF のボックス
#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub box_type: [u8; 4],

    /// ファイル先頭からのボックスの位置
    pub offset: usize,
    pub header_size: usize,
    pub payload: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    pub fn size(&self) -> usize {
        self.header_size + self.payload.len()
    }

    /// 子ボックス（ペイロードの先頭 `skip` バイトを飛ばしてからパースする）
    pub fn children_after(&self, skip: usize) -> Vec<Mp4Box<'a>> {
        parse_boxes(
            &self.payload[skip..],
            self.offset + self.header_size + skip,
        )
    }

    pub fn children(&self) -> Vec<Mp4Box<'a>> {
        self.children_after(0)
    }

    pub fn child(&self, box_type: &[u8; 4]) -> Option<Mp4Box<'a>> {
        self.children()
            .into_iter()
            .find(|b| &b.box_type == box_type)
    }

    pub fn all(&self, box_type: &[u8; 4]) -> Vec<Mp4Box<'a>> {
        self.children()
            .into_iter()
            .filter(|b| &b.box_type == box_type)
            .collect()
    }

    /// `moov/trak/mdia` のようにパスをたどる
    pub fn path(&self, path: &[&[u8; 4]]) -> Option<Mp4Box<'a>> {
        let mut current = *self;
        for ty in path {
            current = current.child(ty)?;
        }
        Some(current)
    }

    pub fn version(&self) -> u8 {
        self.payload[0]
    }

    pub fn flags(&self) -> u32 {
        u32_at(self.payload, 0) & 0x00FF_FFFF
    }
}

pub fn parse_boxes(data: &[u8], base: usize) -> Vec<Mp4Box<'_>> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos + 8 <= data.len() {
        let size32 = u32_at(data, pos) as usize;
        let box_type: [u8; 4] = data[pos + 4..pos + 8].try_into().expect("4 bytes");
        let (size, header_size) = match size32 {
            0 => (data.len() - pos, 8),
            1 => (u64_at(data, pos + 8) as usize, 16),
            n => (n, 8),
        };
        assert!(size >= header_size, "invalid box size {size}");
        assert!(pos + size <= data.len(), "box {box_type:?} overruns its parent");
        boxes.push(Mp4Box {
            box_type,
            offset: base + pos,
            header_size,
            payload: &data[pos + header_size..pos + size],
        });
        pos += size;
    }
    assert_eq!(pos, data.len(), "trailing bytes after boxes");
    boxes
}

pub fn top_level_types(file: &[u8]) -> Vec<[u8; 4]> {
    parse_boxes(file, 0).iter().map(|b| b.box_type).collect()
}

pub fn top_level<'a>(file: &'a [u8], box_type: &[u8; 4]) -> Mp4Box<'a> {
    parse_boxes(file, 0)
        .into_iter()
        .find(|b| &b.box_type == box_type)
        .unwrap_or_else(|| panic!("no {} box", String::from_utf8_lossy(box_type)))
}

/// 非フラグメントのトラックから復元したサンプル
#[derive(Debug, Clone, PartialEq)]
pub struct TableSample {
    pub decode_time: u64,
    pub composition_time: i64,
    pub duration: u32,
    pub offset: u64,
    pub size: u32,
    pub is_key: bool,
}

pub fn timescale(trak: &Mp4Box<'_>) -> u32 {
    let mdhd = trak.path(&[b"mdia", b"mdhd"]).expect("mdhd");
    if mdhd.version() == 1 {
        u32_at(mdhd.payload, 20)
    } else {
        u32_at(mdhd.payload, 12)
    }
}

pub fn handler_type(trak: &Mp4Box<'_>) -> [u8; 4] {
    let hdlr = trak.path(&[b"mdia", b"hdlr"]).expect("hdlr");
    hdlr.payload[8..12].try_into().expect("4 bytes")
}

pub fn stbl<'a>(trak: &Mp4Box<'a>) -> Mp4Box<'a> {
    trak.path(&[b"mdia", b"minf", b"stbl"]).expect("stbl")
}

pub fn sample_entry<'a>(trak: &Mp4Box<'a>) -> Mp4Box<'a> {
    let stsd = stbl(trak).child(b"stsd").expect("stsd");
    stsd.children_after(8)[0]
}

fn entries(b: &Mp4Box<'_>, entry_size: usize) -> Vec<usize> {
    let count = u32_at(b.payload, 4) as usize;
    (0..count).map(|i| 8 + i * entry_size).collect()
}

/// stbl の各テーブルからサンプル一覧を復元する
pub fn table_samples(trak: &Mp4Box<'_>) -> Vec<TableSample> {
    let stbl = stbl(trak);

    let stts = stbl.child(b"stts").expect("stts");
    let mut durations = Vec::new();
    for e in entries(&stts, 8) {
        let count = u32_at(stts.payload, e);
        let delta = u32_at(stts.payload, e + 4);
        durations.extend(std::iter::repeat_n(delta, count as usize));
    }

    let stsz = stbl.child(b"stsz").expect("stsz");
    let constant = u32_at(stsz.payload, 4);
    let count = u32_at(stsz.payload, 8) as usize;
    let sizes: Vec<u32> = if constant != 0 {
        vec![constant; count]
    } else {
        (0..count).map(|i| u32_at(stsz.payload, 12 + i * 4)).collect()
    };
    assert_eq!(sizes.len(), durations.len(), "stsz / stts sample counts differ");

    let mut offsets_of_ctts = vec![0i64; sizes.len()];
    if let Some(ctts) = stbl.child(b"ctts") {
        let mut i = 0;
        for e in entries(&ctts, 8) {
            let count = u32_at(ctts.payload, e);
            let offset = u32_at(ctts.payload, e + 4) as i32 as i64;
            for _ in 0..count {
                offsets_of_ctts[i] = offset;
                i += 1;
            }
        }
        assert_eq!(i, sizes.len(), "ctts sample count differs");
    }

    let chunk_offsets: Vec<u64> = if let Some(stco) = stbl.child(b"stco") {
        entries(&stco, 4)
            .into_iter()
            .map(|e| u32_at(stco.payload, e) as u64)
            .collect()
    } else {
        let co64 = stbl.child(b"co64").expect("stco or co64");
        entries(&co64, 8)
            .into_iter()
            .map(|e| u64_at(co64.payload, e))
            .collect()
    };

    let stsc = stbl.child(b"stsc").expect("stsc");
    let stsc_entries: Vec<(u32, u32)> = entries(&stsc, 12)
        .into_iter()
        .map(|e| (u32_at(stsc.payload, e), u32_at(stsc.payload, e + 4)))
        .collect();

    let keys: Option<Vec<u32>> = stbl.child(b"stss").map(|stss| {
        entries(&stss, 4)
            .into_iter()
            .map(|e| u32_at(stss.payload, e))
            .collect()
    });

    let mut samples = Vec::with_capacity(sizes.len());
    let mut sample = 0usize;
    let mut decode_time = 0u64;
    for (chunk_index, &chunk_offset) in chunk_offsets.iter().enumerate() {
        let chunk_number = chunk_index as u32 + 1;
        let per_chunk = stsc_entries
            .iter()
            .rev()
            .find(|(first, _)| *first <= chunk_number)
            .map(|(_, n)| *n)
            .expect("stsc entry");
        let mut offset = chunk_offset;
        for _ in 0..per_chunk {
            let size = sizes[sample];
            samples.push(TableSample {
                decode_time,
                composition_time: decode_time as i64 + offsets_of_ctts[sample],
                duration: durations[sample],
                offset,
                size,
                is_key: keys
                    .as_ref()
                    .is_none_or(|k| k.contains(&(sample as u32 + 1))),
            });
            decode_time += durations[sample] as u64;
            offset += size as u64;
            sample += 1;
        }
    }
    assert_eq!(sample, sizes.len(), "chunks do not cover all samples");
    samples
}

/// trun から復元したフラグメント内のサンプル
#[derive(Debug, Clone, PartialEq)]
pub struct RunSample {
    pub duration: u32,
    pub size: u32,
    pub is_key: bool,
    pub composition_offset: i32,
}

/// traf の (トラック ID, tfdt, data_offset, サンプル一覧)
pub fn parse_traf(traf: &Mp4Box<'_>) -> (u32, u64, i32, Vec<RunSample>) {
    let tfhd = traf.child(b"tfhd").expect("tfhd");
    let track_id = u32_at(tfhd.payload, 4);
    let tfhd_flags = tfhd.flags();
    let mut pos = 8;
    let mut default_duration = 0;
    let mut default_size = 0;
    let mut default_flags = 0;
    if tfhd_flags & 0x01 != 0 {
        pos += 8;
    }
    if tfhd_flags & 0x02 != 0 {
        pos += 4;
    }
    if tfhd_flags & 0x08 != 0 {
        default_duration = u32_at(tfhd.payload, pos);
        pos += 4;
    }
    if tfhd_flags & 0x10 != 0 {
        default_size = u32_at(tfhd.payload, pos);
        pos += 4;
    }
    if tfhd_flags & 0x20 != 0 {
        default_flags = u32_at(tfhd.payload, pos);
    }

    let tfdt = traf.child(b"tfdt").expect("tfdt");
    let base_decode_time = if tfdt.version() == 1 {
        u64_at(tfdt.payload, 4)
    } else {
        u32_at(tfdt.payload, 4) as u64
    };

    let trun = traf.child(b"trun").expect("trun");
    let flags = trun.flags();
    let count = u32_at(trun.payload, 4) as usize;
    let mut pos = 8;
    let mut data_offset = 0;
    if flags & 0x01 != 0 {
        data_offset = u32_at(trun.payload, pos) as i32;
        pos += 4;
    }
    let mut first_flags = None;
    if flags & 0x04 != 0 {
        first_flags = Some(u32_at(trun.payload, pos));
        pos += 4;
    }
    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let mut read = |bit: u32, default: u32| {
            if flags & bit != 0 {
                let v = u32_at(trun.payload, pos);
                pos += 4;
                v
            } else {
                default
            }
        };
        let duration = read(0x100, default_duration);
        let size = read(0x200, default_size);
        let mut sample_flags = read(0x400, default_flags);
        let composition_offset = read(0x800, 0) as i32;
        if i == 0
            && let Some(f) = first_flags
        {
            sample_flags = f;
        }
        samples.push(RunSample {
            duration,
            size,
            is_key: sample_flags & 0x0001_0000 == 0,
            composition_offset,
        });
    }
    (track_id, base_decode_time, data_offset, samples)
}

/// EBML 要素
#[derive(Debug, Clone, Copy)]
pub struct Element<'a> {
    pub id: u32,
    pub offset: usize,

    /// サイズ不明の要素では `None`（子要素は兄弟として並ぶ）
    pub size: Option<u64>,
    pub data_offset: usize,
    pub payload: &'a [u8],
}

fn read_vint(data: &[u8], pos: usize) -> (u64, usize, bool) {
    let first = data[pos];
    let width = first.leading_zeros() as usize + 1;
    assert!(width <= 8, "invalid VINT at {pos}");
    let mut value = (first as u64) & ((1u64 << (8 - width)) - 1);
    let mut all_ones = value == (1u64 << (8 - width)) - 1;
    for i in 1..width {
        value = (value << 8) | data[pos + i] as u64;
        all_ones &= data[pos + i] == 0xFF;
    }
    (value, width, all_ones)
}

fn read_id(data: &[u8], pos: usize) -> (u32, usize) {
    let width = data[pos].leading_zeros() as usize + 1;
    assert!(width <= 4, "invalid element ID at {pos}");
    let id = data[pos..pos + width]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    (id, width)
}

/// 要素列をパースする（サイズ不明の要素はヘッダーだけを読み、中身は後続の要素として扱う）
pub fn parse_elements(data: &[u8], base: usize) -> Vec<Element<'_>> {
    let mut elements = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (id, id_width) = read_id(data, pos);
        let (size, size_width, unknown) = read_vint(data, pos + id_width);
        let data_start = pos + id_width + size_width;
        if unknown {
            elements.push(Element {
                id,
                offset: base + pos,
                size: None,
                data_offset: base + data_start,
                payload: &[],
            });
            pos = data_start;
            continue;
        }
        let end = data_start + size as usize;
        assert!(end <= data.len(), "element {id:#x} overruns its parent");
        elements.push(Element {
            id,
            offset: base + pos,
            size: Some(size),
            data_offset: base + data_start,
            payload: &data[data_start..end],
        });
        pos = end;
    }
    elements
}

impl<'a> Element<'a> {
    pub fn children(&self) -> Vec<Element<'a>> {
        parse_elements(self.payload, self.data_offset)
    }

    pub fn child(&self, id: u32) -> Option<Element<'a>> {
        self.children().into_iter().find(|e| e.id == id)
    }

    pub fn all(&self, id: u32) -> Vec<Element<'a>> {
        self.children().into_iter().filter(|e| e.id == id).collect()
    }

    pub fn uint(&self) -> u64 {
        self.payload.iter().fold(0, |acc, &b| (acc << 8) | b as u64)
    }

    pub fn int(&self) -> i64 {
        let shift = 64 - 8 * self.payload.len() as u32;
        ((self.uint() << shift) as i64) >> shift
    }

    pub fn float(&self) -> f64 {
        match self.payload.len() {
            4 => f32::from_be_bytes(self.payload.try_into().expect("4 bytes")) as f64,
            8 => f64::from_be_bytes(self.payload.try_into().expect("8 bytes")),
            n => panic!("invalid float size {n}"),
        }
    }

    pub fn string(&self) -> String {
        String::from_utf8_lossy(self.payload)
            .trim_end_matches('\0')
            .to_owned()
    }
}

pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const SEGMENT: u32 = 0x1853_8067;
    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;
    pub const INFO: u32 = 0x1549_A966;
    pub const DURATION: u32 = 0x4489;
    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const VIDEO: u32 = 0xE0;
    pub const ALPHA_MODE: u32 = 0x53C0;
    pub const TAGS: u32 = 0x1254_C367;
    pub const TAG: u32 = 0x7373;
    pub const SIMPLE_TAG: u32 = 0x67C8;
    pub const TAG_NAME: u32 = 0x45A3;
    pub const TAG_STRING: u32 = 0x4487;
    pub const ATTACHMENTS: u32 = 0x1941_A469;
    pub const ATTACHED_FILE: u32 = 0x61A7;
    pub const FILE_NAME: u32 = 0x466E;
    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;
    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

/// クラスター内のブロック
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBlock {
    pub track_number: u64,

    /// 絶対タイムスタンプ（ミリ秒）
    pub timestamp_ms: i64,
    pub is_key: bool,
    pub data: Vec<u8>,

    /// BlockGroup の場合のみ
    pub duration_ms: Option<u64>,
    pub additional: Option<Vec<u8>>,
}

fn parse_block_payload(payload: &[u8], cluster_ms: i64) -> (u64, i64, u8, Vec<u8>) {
    let (track_number, width, _) = read_vint(payload, 0);
    let relative = i16::from_be_bytes([payload[width], payload[width + 1]]) as i64;
    let flags = payload[width + 2];
    (
        track_number,
        cluster_ms + relative,
        flags,
        payload[width + 3..].to_vec(),
    )
}

fn block_from(element: &Element<'_>, cluster_ms: i64) -> Option<ParsedBlock> {
    match element.id {
        ids::SIMPLE_BLOCK => {
            let (track_number, timestamp_ms, flags, data) =
                parse_block_payload(element.payload, cluster_ms);
            Some(ParsedBlock {
                track_number,
                timestamp_ms,
                is_key: flags & 0x80 != 0,
                data,
                duration_ms: None,
                additional: None,
            })
        }
        ids::BLOCK_GROUP => {
            let block = element.child(ids::BLOCK).expect("Block");
            let (track_number, timestamp_ms, _, data) =
                parse_block_payload(block.payload, cluster_ms);
            let additional = element
                .child(ids::BLOCK_ADDITIONS)
                .and_then(|a| a.child(ids::BLOCK_MORE))
                .and_then(|m| m.child(ids::BLOCK_ADDITIONAL))
                .map(|a| a.payload.to_vec());
            Some(ParsedBlock {
                track_number,
                timestamp_ms,
                // ReferenceBlock が無ければキー
                is_key: element.child(0xFB).is_none(),
                data,
                duration_ms: element.child(ids::BLOCK_DURATION).map(|d| d.uint()),
                additional,
            })
        }
        _ => None,
    }
}

/// 一つのクラスター
#[derive(Debug, Clone)]
pub struct ParsedCluster {
    pub offset: usize,
    pub timestamp_ms: i64,
    pub blocks: Vec<ParsedBlock>,
}

/// Matroska ファイル全体
#[derive(Debug)]
pub struct ParsedMatroska<'a> {
    pub doc_type: String,
    pub segment: Element<'a>,

    /// セグメント直下の要素（サイズ不明のクラスターの中身も含めて平坦に並ぶ）
    pub top: Vec<Element<'a>>,
    pub clusters: Vec<ParsedCluster>,
}

impl<'a> ParsedMatroska<'a> {
    pub fn element(&self, id: u32) -> Option<Element<'a>> {
        self.top.iter().copied().find(|e| e.id == id)
    }

    pub fn blocks(&self) -> Vec<ParsedBlock> {
        self.clusters
            .iter()
            .flat_map(|c| c.blocks.iter().cloned())
            .collect()
    }
}

pub fn parse_matroska(file: &[u8]) -> ParsedMatroska<'_> {
    let root = parse_elements(file, 0);
    let header = root.iter().find(|e| e.id == ids::EBML).expect("EBML header");
    let doc_type = header.child(ids::DOC_TYPE).expect("DocType").string();
    let segment = *root
        .iter()
        .find(|e| e.id == ids::SEGMENT)
        .expect("Segment");

    let top = match segment.size {
        Some(_) => segment.children(),
        None => root
            .iter()
            .copied()
            .skip_while(|e| e.id != ids::SEGMENT)
            .skip(1)
            .collect(),
    };

    let mut clusters: Vec<ParsedCluster> = Vec::new();
    let mut in_unknown_cluster = false;
    for element in &top {
        match element.id {
            ids::CLUSTER => {
                in_unknown_cluster = element.size.is_none();
                let mut cluster = ParsedCluster {
                    offset: element.offset,
                    timestamp_ms: 0,
                    blocks: Vec::new(),
                };
                if !in_unknown_cluster {
                    let children = element.children();
                    cluster.timestamp_ms = children
                        .iter()
                        .find(|c| c.id == ids::TIMESTAMP)
                        .expect("cluster Timestamp")
                        .uint() as i64;
                    cluster.blocks = children
                        .iter()
                        .filter_map(|c| block_from(c, cluster.timestamp_ms))
                        .collect();
                }
                clusters.push(cluster);
            }
            // サイズ不明のクラスターの子要素は兄弟として並んでいる
            ids::TIMESTAMP if in_unknown_cluster => {
                if let Some(cluster) = clusters.last_mut() {
                    cluster.timestamp_ms = element.uint() as i64;
                }
            }
            _ if in_unknown_cluster => {
                if let Some(cluster) = clusters.last_mut()
                    && let Some(block) = block_from(element, cluster.timestamp_ms)
                {
                    cluster.blocks.push(block);
                }
            }
            _ => {}
        }
    }

    ParsedMatroska {
        doc_type,
        segment,
        top,
        clusters,
    }
}
