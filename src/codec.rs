//! 符号化データやコーデック文字列からデコーダー設定レコードを導出する処理
use crate::{
    Error, Result,
    bits::{BitReader, BitWriter, write_bits},
    metadata::{MatrixCoefficients, VideoColorSpace},
};

/// Annex-B 形式のバイト列から 3 / 4 バイトのスタートコードで区切られた NAL ユニットを取り出す
pub fn find_nal_units_in_annex_b(data: &[u8]) -> Vec<&[u8]> {
    // (スタートコードの開始位置, ペイロードの開始位置)
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((code_start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (k, &(_, begin)) in starts.iter().enumerate() {
        let end = starts.get(k + 1).map_or(data.len(), |&(c, _)| c);
        if end > begin {
            units.push(&data[begin..end]);
        }
    }
    units
}

/// Annex-B 形式のバイト列を 4 バイト長プレフィックス形式に変換する
///
/// エミュレーション防止バイトはそのまま保持される
pub fn annex_b_to_length_prefixed(data: &[u8]) -> Result<Vec<u8>> {
    let units = find_nal_units_in_annex_b(data);
    if units.is_empty() {
        return Err(Error::invalid_data(
            "No NAL units found; packets must be in Annex B format when no description is provided",
        ));
    }
    let mut out = Vec::with_capacity(data.len() + units.len());
    for unit in units {
        let size = u32::try_from(unit.len())
            .map_err(|_| Error::invalid_data(format!("Too large NAL unit: {}", unit.len())))?;
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(unit);
    }
    Ok(out)
}

/// NAL ユニットからエミュレーション防止バイト (`00 00 03` の `03`) を取り除く
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

const AVC_NAL_SPS: u8 = 7;
const AVC_NAL_PPS: u8 = 8;
const AVC_NAL_SPS_EXT: u8 = 13;

/// AVC の SPS から読み取った値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AvcSpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
}

/// AVC の SPS NAL ユニット（NAL ヘッダ込み）をパースする
pub fn parse_avc_sps(sps: &[u8]) -> Result<AvcSpsInfo> {
    let rbsp = remove_emulation_prevention(sps);
    let mut reader = BitReader::new(&rbsp);
    reader.skip_bits(8)?;
    let profile_idc = reader.read_bits(8)? as u8;
    let constraint_flags = reader.read_bits(8)? as u8;
    let level_idc = reader.read_bits(8)? as u8;
    let _seq_parameter_set_id = reader.read_ue()?;

    let mut info = AvcSpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        chroma_format_idc: 1,
        bit_depth_luma_minus8: 0,
        bit_depth_chroma_minus8: 0,
    };
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        info.chroma_format_idc = reader.read_ue()? as u8;
        if info.chroma_format_idc == 3 {
            let _separate_colour_plane_flag = reader.read_bit()?;
        }
        info.bit_depth_luma_minus8 = reader.read_ue()? as u8;
        info.bit_depth_chroma_minus8 = reader.read_ue()? as u8;
    }
    Ok(info)
}

/// AVCDecoderConfigurationRecord (ISO/IEC 14496-15)
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AvcDecoderConfigurationRecord {
    pub avc_profile_indication: u8,
    pub profile_compatibility: u8,
    pub avc_level_indication: u8,
    pub length_size_minus_one: u8,
    pub sps_list: Vec<Vec<u8>>,
    pub pps_list: Vec<Vec<u8>>,
    pub chroma_format: Option<u8>,
    pub bit_depth_luma_minus8: Option<u8>,
    pub bit_depth_chroma_minus8: Option<u8>,
    pub sps_ext_list: Vec<Vec<u8>>,
}

impl AvcDecoderConfigurationRecord {
    const CONFIGURATION_VERSION: u8 = 1;

    /// レコードをバイト列にシリアライズする
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![
            Self::CONFIGURATION_VERSION,
            self.avc_profile_indication,
            self.profile_compatibility,
            self.avc_level_indication,
            0b1111_1100 | self.length_size_minus_one,
        ];

        let sps_count =
            u8::try_from(self.sps_list.len()).map_err(|_| Error::invalid_input("Too many SPSs"))?;
        buf.push(0b1110_0000 | sps_count);
        for sps in &self.sps_list {
            push_u16_prefixed(&mut buf, sps, "Too long SPS")?;
        }

        let pps_count =
            u8::try_from(self.pps_list.len()).map_err(|_| Error::invalid_input("Too many PPSs"))?;
        buf.push(pps_count);
        for pps in &self.pps_list {
            push_u16_prefixed(&mut buf, pps, "Too long PPS")?;
        }

        if !matches!(self.avc_profile_indication, 66 | 77 | 88) {
            let chroma_format = self
                .chroma_format
                .ok_or_else(|| Error::invalid_input("Missing 'chroma_format' field in 'avcC'"))?;
            let bit_depth_luma_minus8 = self.bit_depth_luma_minus8.ok_or_else(|| {
                Error::invalid_input("Missing 'bit_depth_luma_minus8' field in 'avcC'")
            })?;
            let bit_depth_chroma_minus8 = self.bit_depth_chroma_minus8.ok_or_else(|| {
                Error::invalid_input("Missing 'bit_depth_chroma_minus8' field in 'avcC'")
            })?;
            buf.push(0b1111_1100 | chroma_format);
            buf.push(0b1111_1000 | bit_depth_luma_minus8);
            buf.push(0b1111_1000 | bit_depth_chroma_minus8);

            let sps_ext_count = u8::try_from(self.sps_ext_list.len())
                .map_err(|_| Error::invalid_input("Too many SPS EXTs"))?;
            buf.push(sps_ext_count);
            for sps_ext in &self.sps_ext_list {
                push_u16_prefixed(&mut buf, sps_ext, "Too long SPS EXT")?;
            }
        }
        Ok(buf)
    }

    /// `avc1.PPCCLL` 形式のコーデック文字列を返す
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.avc_profile_indication, self.profile_compatibility, self.avc_level_indication
        )
    }
}

fn push_u16_prefixed(buf: &mut Vec<u8>, data: &[u8], reason: &str) -> Result<()> {
    let size = u16::try_from(data.len()).map_err(|_| Error::invalid_input(reason))?;
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

/// Annex-B 形式の AVC パケットに含まれるパラメーターセットから AVCDecoderConfigurationRecord を生成する
pub fn extract_avc_decoder_configuration_record(
    packet: &[u8],
) -> Result<AvcDecoderConfigurationRecord> {
    let units = find_nal_units_in_annex_b(packet);
    let of_type = |t: u8| -> Vec<Vec<u8>> {
        units
            .iter()
            .filter(|u| u[0] & 0x1f == t)
            .map(|u| u.to_vec())
            .collect()
    };
    let sps_list = of_type(AVC_NAL_SPS);
    let pps_list = of_type(AVC_NAL_PPS);
    let sps_ext_list = of_type(AVC_NAL_SPS_EXT);

    let Some(first_sps) = sps_list.first() else {
        return Err(Error::invalid_data(
            "Couldn't find an SPS in the AVC packet; packets must be in Annex B format when no description is provided",
        ));
    };
    if pps_list.is_empty() {
        return Err(Error::invalid_data(
            "Couldn't find a PPS in the AVC packet; packets must be in Annex B format when no description is provided",
        ));
    }

    let info = parse_avc_sps(first_sps)?;
    let extended = !matches!(info.profile_idc, 66 | 77 | 88);
    Ok(AvcDecoderConfigurationRecord {
        avc_profile_indication: info.profile_idc,
        profile_compatibility: info.constraint_flags,
        avc_level_indication: info.level_idc,
        length_size_minus_one: 3,
        sps_list,
        pps_list,
        chroma_format: extended.then_some(info.chroma_format_idc),
        bit_depth_luma_minus8: extended.then_some(info.bit_depth_luma_minus8),
        bit_depth_chroma_minus8: extended.then_some(info.bit_depth_chroma_minus8),
        sps_ext_list: if extended { sps_ext_list } else { Vec::new() },
    })
}

const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;
const HEVC_NAL_PREFIX_SEI: u8 = 39;
const HEVC_NAL_SUFFIX_SEI: u8 = 40;

fn hevc_nal_unit_type(unit: &[u8]) -> u8 {
    (unit[0] >> 1) & 0x3f
}

/// HEVC の SPS から読み取った値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HevcSpsInfo {
    pub general_profile_space: u8,
    pub general_tier_flag: u8,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: [u8; 6],
    pub general_level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub max_sub_layers: u8,
    pub temporal_id_nested: u8,
}

/// HEVC の SPS NAL ユニット（NAL ヘッダ込み）をパースする
pub fn parse_hevc_sps(sps: &[u8]) -> Result<HevcSpsInfo> {
    let rbsp = remove_emulation_prevention(sps);
    let mut reader = BitReader::new(&rbsp);
    reader.skip_bits(16)?;
    let _sps_video_parameter_set_id = reader.read_bits(4)?;
    let max_sub_layers_minus1 = reader.read_bits(3)? as usize;
    if max_sub_layers_minus1 > 6 {
        return Err(Error::invalid_data(format!(
            "Invalid HEVC sps_max_sub_layers_minus1: {max_sub_layers_minus1}"
        )));
    }
    let temporal_id_nested = reader.read_bit()?;

    // profile_tier_level()
    let general_profile_space = reader.read_bits(2)? as u8;
    let general_tier_flag = reader.read_bit()?;
    let general_profile_idc = reader.read_bits(5)? as u8;
    let general_profile_compatibility_flags = reader.read_bits(32)? as u32;
    let mut general_constraint_indicator_flags = [0; 6];
    for b in &mut general_constraint_indicator_flags {
        *b = reader.read_bits(8)? as u8;
    }
    let general_level_idc = reader.read_bits(8)? as u8;

    let mut sub_layer_flags = Vec::with_capacity(max_sub_layers_minus1);
    for _ in 0..max_sub_layers_minus1 {
        let profile_present = reader.read_bit()? == 1;
        let level_present = reader.read_bit()? == 1;
        sub_layer_flags.push((profile_present, level_present));
    }
    if max_sub_layers_minus1 > 0 {
        reader.skip_bits(2 * (8 - max_sub_layers_minus1))?;
    }
    for (profile_present, level_present) in sub_layer_flags {
        if profile_present {
            reader.skip_bits(88)?;
        }
        if level_present {
            reader.skip_bits(8)?;
        }
    }

    let _sps_seq_parameter_set_id = reader.read_ue()?;
    let chroma_format_idc = reader.read_ue()? as u8;
    if chroma_format_idc == 3 {
        let _separate_colour_plane_flag = reader.read_bit()?;
    }
    let _pic_width_in_luma_samples = reader.read_ue()?;
    let _pic_height_in_luma_samples = reader.read_ue()?;
    if reader.read_bit()? == 1 {
        // conformance_window_flag
        for _ in 0..4 {
            reader.read_ue()?;
        }
    }
    let bit_depth_luma_minus8 = reader.read_ue()? as u8;
    let bit_depth_chroma_minus8 = reader.read_ue()? as u8;

    Ok(HevcSpsInfo {
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        chroma_format_idc,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        max_sub_layers: max_sub_layers_minus1 as u8 + 1,
        temporal_id_nested,
    })
}

/// hvcC 内の NAL ユニット配列
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HevcNalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    pub nal_units: Vec<Vec<u8>>,
}

/// HEVCDecoderConfigurationRecord (ISO/IEC 14496-15)
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct HevcDecoderConfigurationRecord {
    pub general_profile_space: u8,
    pub general_tier_flag: u8,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: [u8; 6],
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: u8,
    pub length_size_minus_one: u8,
    pub nal_arrays: Vec<HevcNalArray>,
}

impl HevcDecoderConfigurationRecord {
    const CONFIGURATION_VERSION: u8 = 1;

    /// レコードをバイト列にシリアライズする
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        // numTemporalLayers は 3 ビット
        if self.num_temporal_layers > 7 {
            return Err(Error::invalid_input(format!(
                "Too many HEVC temporal layers: {}",
                self.num_temporal_layers
            )));
        }
        let mut buf = vec![
            Self::CONFIGURATION_VERSION,
            (self.general_profile_space << 6)
                | (self.general_tier_flag << 5)
                | self.general_profile_idc,
        ];
        buf.extend_from_slice(&self.general_profile_compatibility_flags.to_be_bytes());
        buf.extend_from_slice(&self.general_constraint_indicator_flags);
        buf.push(self.general_level_idc);
        buf.extend_from_slice(&(0xf000 | self.min_spatial_segmentation_idc).to_be_bytes());
        buf.push(0b1111_1100 | self.parallelism_type);
        buf.push(0b1111_1100 | self.chroma_format_idc);
        buf.push(0b1111_1000 | self.bit_depth_luma_minus8);
        buf.push(0b1111_1000 | self.bit_depth_chroma_minus8);
        buf.extend_from_slice(&self.avg_frame_rate.to_be_bytes());
        buf.push(
            (self.constant_frame_rate << 6)
                | (self.num_temporal_layers << 3)
                | (self.temporal_id_nested << 2)
                | self.length_size_minus_one,
        );
        buf.push(u8::try_from(self.nal_arrays.len()).map_err(|_| {
            Error::invalid_input(format!("Too many NALU arrays: {}", self.nal_arrays.len()))
        })?);
        for array in &self.nal_arrays {
            buf.push(((array.array_completeness as u8) << 7) | array.nal_unit_type);
            let count = u16::try_from(array.nal_units.len()).map_err(|_| {
                Error::invalid_input(format!("Too many NALUs: {}", array.nal_units.len()))
            })?;
            buf.extend_from_slice(&count.to_be_bytes());
            for unit in &array.nal_units {
                push_u16_prefixed(&mut buf, unit, "Too large NALU")?;
            }
        }
        Ok(buf)
    }
}

/// Annex-B 形式の HEVC パケットに含まれるパラメーターセットから HEVCDecoderConfigurationRecord を生成する
pub fn extract_hevc_decoder_configuration_record(
    packet: &[u8],
) -> Result<HevcDecoderConfigurationRecord> {
    let units = find_nal_units_in_annex_b(packet);
    let of_types = |types: &[u8]| -> Vec<Vec<u8>> {
        units
            .iter()
            .filter(|u| u.len() >= 2 && types.contains(&hevc_nal_unit_type(u)))
            .map(|u| u.to_vec())
            .collect()
    };
    let vps = of_types(&[HEVC_NAL_VPS]);
    let sps = of_types(&[HEVC_NAL_SPS]);
    let pps = of_types(&[HEVC_NAL_PPS]);
    let sei = of_types(&[HEVC_NAL_PREFIX_SEI, HEVC_NAL_SUFFIX_SEI]);

    let Some(first_sps) = sps.first() else {
        return Err(Error::invalid_data(
            "Couldn't find an SPS in the HEVC packet; packets must be in Annex B format when no description is provided",
        ));
    };
    if pps.is_empty() {
        return Err(Error::invalid_data(
            "Couldn't find a PPS in the HEVC packet; packets must be in Annex B format when no description is provided",
        ));
    }
    let info = parse_hevc_sps(first_sps)?;

    let mut nal_arrays = Vec::new();
    for (nal_unit_type, nal_units) in [(HEVC_NAL_VPS, vps), (HEVC_NAL_SPS, sps), (HEVC_NAL_PPS, pps)]
    {
        if !nal_units.is_empty() {
            nal_arrays.push(HevcNalArray {
                array_completeness: true,
                nal_unit_type,
                nal_units,
            });
        }
    }
    if let Some(first) = sei.first() {
        nal_arrays.push(HevcNalArray {
            array_completeness: true,
            nal_unit_type: hevc_nal_unit_type(first),
            nal_units: sei,
        });
    }

    Ok(HevcDecoderConfigurationRecord {
        general_profile_space: info.general_profile_space,
        general_tier_flag: info.general_tier_flag,
        general_profile_idc: info.general_profile_idc,
        general_profile_compatibility_flags: info.general_profile_compatibility_flags,
        general_constraint_indicator_flags: info.general_constraint_indicator_flags,
        general_level_idc: info.general_level_idc,
        min_spatial_segmentation_idc: 0,
        parallelism_type: 0,
        chroma_format_idc: info.chroma_format_idc,
        bit_depth_luma_minus8: info.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: info.bit_depth_chroma_minus8,
        avg_frame_rate: 0,
        constant_frame_rate: 0,
        num_temporal_layers: info.max_sub_layers,
        temporal_id_nested: info.temporal_id_nested,
        length_size_minus_one: 3,
        nal_arrays,
    })
}

fn parse_codec_field(codec: &str, field: Option<&str>, name: &str) -> Result<u8> {
    let field = field.ok_or_else(|| {
        Error::invalid_input(format!("Missing {name} in codec string {codec:?}"))
    })?;
    field
        .parse()
        .map_err(|_| Error::invalid_input(format!("Invalid {name} in codec string {codec:?}")))
}

/// VP8 / VP9 のコーデック設定 (vpcC の中身)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct VpCodecConfig {
    pub profile: u8,
    pub level: u8,
    pub bit_depth: u8,
    pub chroma_subsampling: u8,
    pub video_full_range_flag: u8,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl VpCodecConfig {
    /// VP8 用の固定設定を返す
    pub fn vp8(color_space: Option<&VideoColorSpace>) -> Self {
        let mut config = Self {
            profile: 0,
            level: 10,
            bit_depth: 8,
            chroma_subsampling: 1,
            video_full_range_flag: 0,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
        };
        config.apply_color_space(color_space);
        config
    }

    /// `vp09.PP.LL.DD[.CC.cp.tc.mc.FF]` 形式のコーデック文字列から設定を生成する
    ///
    /// 省略されたフィールドは色空間の指定、それもなければ既定値で補われる
    pub fn from_vp9_codec_string(
        codec: &str,
        color_space: Option<&VideoColorSpace>,
    ) -> Result<Self> {
        let parts: Vec<&str> = codec.split('.').collect();
        if parts.first() != Some(&"vp09") {
            return Err(Error::invalid_input(format!(
                "Not a VP9 codec string: {codec:?}"
            )));
        }
        let field = |i: usize, name: &str| parse_codec_field(codec, parts.get(i).copied(), name);
        let mut config = Self {
            profile: field(1, "profile")?,
            level: field(2, "level")?,
            bit_depth: field(3, "bit depth")?,
            chroma_subsampling: 1,
            video_full_range_flag: 0,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
        };
        config.apply_color_space(color_space);
        if parts.len() > 4 {
            config.chroma_subsampling = field(4, "chroma subsampling")?;
        }
        if parts.len() > 5 {
            config.colour_primaries = field(5, "colour primaries")?;
        }
        if parts.len() > 6 {
            config.transfer_characteristics = field(6, "transfer characteristics")?;
        }
        if parts.len() > 7 {
            config.matrix_coefficients = field(7, "matrix coefficients")?;
        }
        if parts.len() > 8 {
            config.video_full_range_flag = field(8, "video full range flag")?;
        }
        Ok(config)
    }

    fn apply_color_space(&mut self, color_space: Option<&VideoColorSpace>) {
        let Some(cs) = color_space else {
            return;
        };
        if let Some(p) = cs.primaries {
            self.colour_primaries = p.code();
        }
        if let Some(t) = cs.transfer {
            self.transfer_characteristics = t.code();
        }
        if let Some(m) = cs.matrix {
            self.matrix_coefficients = m.code();
        }
        if let Some(full_range) = cs.full_range {
            self.video_full_range_flag = full_range as u8;
        }
    }

    /// vpcC ボックス（バージョン 1）のペイロード部分を返す
    pub fn to_vpcc_payload(&self) -> Vec<u8> {
        vec![
            self.profile,
            self.level,
            (self.bit_depth << 4) | (self.chroma_subsampling << 1) | self.video_full_range_flag,
            self.colour_primaries,
            self.transfer_characteristics,
            self.matrix_coefficients,
            0,
            0,
        ]
    }

    /// Matroska の VP9 CodecPrivate（コーデック機能メタデータ）を返す
    pub fn to_matroska_codec_private(&self) -> Vec<u8> {
        vec![
            1,
            1,
            self.profile,
            2,
            1,
            self.level,
            3,
            1,
            self.bit_depth,
            4,
            1,
            self.chroma_subsampling,
        ]
    }
}

/// `av01.P.LLT.DD[.M.CCC.cp.tc.mc.F]` 形式のコーデック文字列から av1C の先頭 4 バイトを生成する
pub fn av1_config_from_codec_string(codec: &str) -> Result<[u8; 4]> {
    let parts: Vec<&str> = codec.split('.').collect();
    if parts.first() != Some(&"av01") {
        return Err(Error::invalid_input(format!(
            "Not an AV1 codec string: {codec:?}"
        )));
    }
    let profile = parse_codec_field(codec, parts.get(1).copied(), "profile")?;
    let level_and_tier = parts
        .get(2)
        .filter(|s| s.len() >= 2)
        .ok_or_else(|| Error::invalid_input(format!("Missing level in codec string {codec:?}")))?;
    let (level, tier) = level_and_tier.split_at(level_and_tier.len() - 1);
    let level: u8 = level
        .parse()
        .map_err(|_| Error::invalid_input(format!("Invalid level in codec string {codec:?}")))?;
    let tier = match tier {
        "M" => 0,
        "H" => 1,
        _ => {
            return Err(Error::invalid_input(format!(
                "Invalid tier in codec string {codec:?}"
            )));
        }
    };
    let bit_depth = parse_codec_field(codec, parts.get(3).copied(), "bit depth")?;
    let monochrome = match parts.get(4) {
        Some(_) => parse_codec_field(codec, parts.get(4).copied(), "monochrome")?,
        None => 0,
    };
    let (subsampling_x, subsampling_y, sample_position) = match parts.get(5) {
        Some(ccc) if ccc.len() == 3 && ccc.bytes().all(|b| b.is_ascii_digit()) => {
            let b = ccc.as_bytes();
            (b[0] - b'0', b[1] - b'0', b[2] - b'0')
        }
        Some(_) => {
            return Err(Error::invalid_input(format!(
                "Invalid chroma subsampling in codec string {codec:?}"
            )));
        }
        None => (1, 1, 0),
    };

    let high_bitdepth = (bit_depth > 8) as u8;
    let twelve_bit = (bit_depth == 12) as u8;
    Ok([
        0x80 | 1,
        (profile << 5) | (level & 0x1f),
        (tier << 7)
            | (high_bitdepth << 6)
            | (twelve_bit << 5)
            | (monochrome << 4)
            | (subsampling_x << 3)
            | (subsampling_y << 2)
            | (sample_position & 0b11),
        0,
    ])
}

const AAC_SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// `mp4a.40.N` 形式のコーデック文字列から AudioSpecificConfig を生成する
pub fn aac_audio_specific_config(
    codec: &str,
    sample_rate: u32,
    number_of_channels: u32,
) -> Result<Vec<u8>> {
    let object_type: u32 = match codec.strip_prefix("mp4a.40.") {
        Some(n) => n.parse().map_err(|_| {
            Error::invalid_input(format!("Invalid AAC object type in {codec:?}"))
        })?,
        None => 2,
    };
    if object_type == 0 || object_type > 45 {
        return Err(Error::invalid_input(format!(
            "Invalid AAC object type in {codec:?}"
        )));
    }
    let channel_configuration = match number_of_channels {
        1..=6 => number_of_channels,
        8 => 7,
        _ => {
            return Err(Error::unsupported(format!(
                "Cannot derive an AAC channel configuration for {number_of_channels} channels; provide a description"
            )));
        }
    };

    let mut writer = BitWriter::new();
    if object_type < 31 {
        writer.write_bits(5, object_type);
    } else {
        writer.write_bits(5, 31);
        writer.write_bits(6, object_type - 32);
    }
    match AAC_SAMPLING_FREQUENCIES
        .iter()
        .position(|&f| f == sample_rate)
    {
        Some(index) => writer.write_bits(4, index as u32),
        None => {
            writer.write_bits(4, 0xf);
            writer.write_bits(24, sample_rate);
        }
    }
    writer.write_bits(4, channel_configuration);
    // GASpecificConfig: frameLengthFlag, dependsOnCoreCoder, extensionFlag
    writer.write_bits(3, 0);
    Ok(writer.into_bytes())
}

/// Opus の識別ヘッダ (`OpusHead`)
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OpusHead {
    pub output_channel_count: u8,
    pub pre_skip: u16,
    pub input_sample_rate: u32,
    pub output_gain: i16,
    pub channel_mapping_family: u8,

    /// stream count, coupled count, channel mapping を連結したもの（family 0 では空）
    pub channel_mapping_table: Vec<u8>,
}

impl OpusHead {
    const MAGIC: &'static [u8; 8] = b"OpusHead";

    /// 説明データが与えられない場合に使われる既定の pre-skip 値（48 kHz で 80 ms）
    pub const DEFAULT_PRE_SKIP: u16 = 3840;

    /// チャンネル数と入力サンプリングレートから既定のヘッダを生成する
    pub fn with_defaults(output_channel_count: u8, input_sample_rate: u32) -> Self {
        Self {
            output_channel_count,
            pre_skip: Self::DEFAULT_PRE_SKIP,
            input_sample_rate,
            output_gain: 0,
            channel_mapping_family: 0,
            channel_mapping_table: Vec::new(),
        }
    }

    /// `OpusHead` 形式（リトルエンディアン）のバイト列を返す
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Self::MAGIC.to_vec();
        buf.push(1);
        buf.push(self.output_channel_count);
        buf.extend_from_slice(&self.pre_skip.to_le_bytes());
        buf.extend_from_slice(&self.input_sample_rate.to_le_bytes());
        buf.extend_from_slice(&self.output_gain.to_le_bytes());
        buf.push(self.channel_mapping_family);
        buf.extend_from_slice(&self.channel_mapping_table);
        buf
    }

    /// dOps ボックス（ビッグエンディアン）のペイロードを返す
    pub fn to_dops_payload(&self) -> Vec<u8> {
        let mut buf = vec![0, self.output_channel_count];
        buf.extend_from_slice(&self.pre_skip.to_be_bytes());
        buf.extend_from_slice(&self.input_sample_rate.to_be_bytes());
        buf.extend_from_slice(&self.output_gain.to_be_bytes());
        buf.push(self.channel_mapping_family);
        buf.extend_from_slice(&self.channel_mapping_table);
        buf
    }
}

/// `OpusHead` 識別ヘッダをパースする
pub fn parse_opus_head(data: &[u8]) -> Result<OpusHead> {
    if data.len() < 19 || &data[..8] != OpusHead::MAGIC {
        return Err(Error::invalid_data(
            "Invalid Opus identification header: expected at least 19 bytes starting with \"OpusHead\"",
        ));
    }
    let output_channel_count = data[9];
    let channel_mapping_family = data[18];
    let channel_mapping_table = if channel_mapping_family == 0 {
        Vec::new()
    } else {
        let end = 21 + output_channel_count as usize;
        data.get(19..end)
            .ok_or_else(|| Error::invalid_data("Truncated Opus channel mapping table"))?
            .to_vec()
    };
    Ok(OpusHead {
        output_channel_count,
        pre_skip: u16::from_le_bytes([data[10], data[11]]),
        input_sample_rate: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        output_gain: i16::from_le_bytes([data[16], data[17]]),
        channel_mapping_family,
        channel_mapping_table,
    })
}

/// FLAC の STREAMINFO ブロックの主要な値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FlacStreamInfo {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub total_samples: u64,
}

/// FLAC のメタデータブロック
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FlacMetadataBlock {
    pub block_type: u8,
    pub data: Vec<u8>,
}

/// `fLaC` マーカーに続くメタデータブロック列
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FlacHeader {
    pub stream_info: FlacStreamInfo,
    pub blocks: Vec<FlacMetadataBlock>,
}

impl FlacHeader {
    const STREAMINFO: u8 = 0;

    /// dfLa ボックスのペイロード（メタデータブロック列）を返す
    pub fn to_dfla_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let last = (i + 1 == self.blocks.len()) as u8;
            buf.push((last << 7) | block.block_type);
            buf.extend_from_slice(&(block.data.len() as u32).to_be_bytes()[1..]);
            buf.extend_from_slice(&block.data);
        }
        buf
    }
}

/// `fLaC` マーカーと STREAMINFO から始まる FLAC ヘッダをパースする
pub fn parse_flac_header(data: &[u8]) -> Result<FlacHeader> {
    if data.len() < 4 || &data[..4] != b"fLaC" {
        return Err(Error::invalid_data(
            "FLAC description must start with the \"fLaC\" marker",
        ));
    }
    let mut blocks = Vec::new();
    let mut offset = 4;
    loop {
        let header = data
            .get(offset..offset + 4)
            .ok_or_else(|| Error::invalid_data("Truncated FLAC metadata block header"))?;
        let last = header[0] & 0x80 != 0;
        let block_type = header[0] & 0x7f;
        let size = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        offset += 4;
        let block = data
            .get(offset..offset + size)
            .ok_or_else(|| Error::invalid_data("Truncated FLAC metadata block"))?;
        blocks.push(FlacMetadataBlock {
            block_type,
            data: block.to_vec(),
        });
        offset += size;
        if last || offset >= data.len() {
            break;
        }
    }

    let stream_info = blocks
        .first()
        .filter(|b| b.block_type == FlacHeader::STREAMINFO && b.data.len() >= 18)
        .ok_or_else(|| Error::invalid_data("First FLAC metadata block must be STREAMINFO"))?;
    let mut reader = BitReader::new(&stream_info.data[10..18]);
    let sample_rate = reader.read_bits(20)? as u32;
    let channels = reader.read_bits(3)? as u8 + 1;
    let bits_per_sample = reader.read_bits(5)? as u8 + 1;
    let total_samples = reader.read_bits(36)?;

    Ok(FlacHeader {
        stream_info: FlacStreamInfo {
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
        },
        blocks,
    })
}

/// PCM サンプルのデータ型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcmDataType {
    /// 符号なし整数
    Unsigned,

    /// 符号付き整数
    Signed,

    /// IEEE 浮動小数点数
    Float,

    /// G.711 μ-law
    Ulaw,

    /// G.711 A-law
    Alaw,
}

/// 非圧縮 PCM の形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PcmFormat {
    /// データ型
    pub data_type: PcmDataType,

    /// 1 サンプルあたりのバイト数
    pub sample_size: u8,

    /// リトルエンディアンかどうか
    pub little_endian: bool,
}

impl PcmFormat {
    /// `pcm-s16` などのコーデック文字列をパースする
    pub fn from_codec_string(codec: &str) -> Result<Self> {
        let (data_type, sample_size, little_endian) = match codec {
            "pcm-u8" => (PcmDataType::Unsigned, 1, true),
            "pcm-s16" => (PcmDataType::Signed, 2, true),
            "pcm-s16be" => (PcmDataType::Signed, 2, false),
            "pcm-s24" => (PcmDataType::Signed, 3, true),
            "pcm-s24be" => (PcmDataType::Signed, 3, false),
            "pcm-s32" => (PcmDataType::Signed, 4, true),
            "pcm-s32be" => (PcmDataType::Signed, 4, false),
            "pcm-f32" => (PcmDataType::Float, 4, true),
            "pcm-f32be" => (PcmDataType::Float, 4, false),
            "pcm-f64" => (PcmDataType::Float, 8, true),
            "pcm-f64be" => (PcmDataType::Float, 8, false),
            "ulaw" => (PcmDataType::Ulaw, 1, true),
            "alaw" => (PcmDataType::Alaw, 1, true),
            _ => {
                return Err(Error::unsupported(format!(
                    "Unknown PCM codec string: {codec:?}"
                )));
            }
        };
        Ok(Self {
            data_type,
            sample_size,
            little_endian,
        })
    }

    /// コーデック文字列を返す
    pub fn codec_string(&self) -> String {
        let prefix = match self.data_type {
            PcmDataType::Ulaw => return "ulaw".to_owned(),
            PcmDataType::Alaw => return "alaw".to_owned(),
            PcmDataType::Unsigned => "u",
            PcmDataType::Signed => "s",
            PcmDataType::Float => "f",
        };
        let suffix = if self.little_endian || self.sample_size == 1 {
            ""
        } else {
            "be"
        };
        format!("pcm-{prefix}{}{suffix}", self.sample_size as u32 * 8)
    }

    /// 無音を表すバイト値
    pub fn silent_value(&self) -> u8 {
        match self.data_type {
            PcmDataType::Unsigned => 0x80,
            PcmDataType::Ulaw => 0xff,
            PcmDataType::Alaw => 0xd5,
            PcmDataType::Signed | PcmDataType::Float => 0,
        }
    }
}

/// VP9 のキーフレームのフレームヘッダに含まれる color_space フィールドを `matrix` に合わせて書き換える
///
/// 書き換えを行った場合は `true` を返す
pub fn fix_vp9_color_space(frame: &mut [u8], matrix: MatrixCoefficients) -> Result<bool> {
    let mut reader = BitReader::new(frame);
    let _frame_marker = reader.read_bits(2)?;
    let profile_low_bit = reader.read_bit()?;
    let profile_high_bit = reader.read_bit()?;
    let profile = (profile_high_bit << 1) | profile_low_bit;
    if profile == 3 {
        reader.skip_bits(1)?;
    }
    let show_existing_frame = reader.read_bit()?;
    if show_existing_frame == 1 {
        return Ok(false);
    }
    let frame_type = reader.read_bit()?;
    if frame_type != 0 {
        return Ok(false);
    }
    // show_frame, error_resilient_mode
    reader.skip_bits(2)?;
    let sync_code = reader.read_bits(24)?;
    if sync_code != 0x49_83_42 {
        return Ok(false);
    }
    if profile >= 2 {
        // ten_or_twelve_bit
        reader.skip_bits(1)?;
    }

    let color_space = match matrix {
        MatrixCoefficients::Rgb => 7,
        MatrixCoefficients::Bt709 => 2,
        MatrixCoefficients::Bt470bg => 1,
        MatrixCoefficients::Smpte170m => 3,
        MatrixCoefficients::Bt2020Ncl => 5,
    };
    let pos = reader.pos();
    write_bits(frame, pos, pos + 3, color_space)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Baseline 以外 (High, profile_idc = 100) の SPS を含む Annex-B パケット
    const AVC_HIGH_PACKET: &[u8] = &[
        0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40, 0x50, //
        0, 0, 0, 1, 0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0, //
        0, 0, 1, 0x65, 0x88, 0x84, 0x00,
    ];

    #[test]
    fn annex_b_scanning() {
        let units = find_nal_units_in_annex_b(AVC_HIGH_PACKET);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0][0] & 0x1f, 7);
        assert_eq!(units[1][0] & 0x1f, 8);
        assert_eq!(units[2], &[0x65, 0x88, 0x84, 0x00]);

        let prefixed = annex_b_to_length_prefixed(AVC_HIGH_PACKET).unwrap();
        assert_eq!(&prefixed[..4], &[0, 0, 0, 8]);
        assert_eq!(prefixed.len(), 4 + 8 + 4 + 6 + 4 + 4);
    }

    #[test]
    fn emulation_prevention_is_removed_only_for_parsing() {
        let data = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03];
        assert_eq!(remove_emulation_prevention(&data), vec![0, 0, 1, 0, 0]);

        let packet = [0, 0, 0, 1, 0x65, 0x00, 0x00, 0x03, 0x01];
        let prefixed = annex_b_to_length_prefixed(&packet).unwrap();
        assert_eq!(&prefixed[4..], &[0x65, 0x00, 0x00, 0x03, 0x01]);
    }

    #[test]
    fn avc_record_from_annex_b() {
        let record = extract_avc_decoder_configuration_record(AVC_HIGH_PACKET).unwrap();
        assert_eq!(record.avc_profile_indication, 100);
        assert_eq!(record.profile_compatibility, 0);
        assert_eq!(record.avc_level_indication, 31);
        assert_eq!(record.chroma_format, Some(1));
        assert_eq!(record.bit_depth_luma_minus8, Some(0));
        assert_eq!(record.codec_string(), "avc1.64001f");

        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[..6], &[1, 100, 0, 31, 0xff, 0xe1]);
        assert_eq!(&bytes[bytes.len() - 4..], &[0xfd, 0xf8, 0xf8, 0x00]);
    }

    #[test]
    fn avc_record_without_pps_is_an_error() {
        let packet = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0xf4];
        let error = extract_avc_decoder_configuration_record(&packet).unwrap_err();
        assert_eq!(error.kind, crate::ErrorKind::InvalidData);
    }

    #[test]
    fn hevc_temporal_layers_must_fit_in_three_bits() {
        // sps_max_sub_layers_minus1 = 7
        let error = parse_hevc_sps(&[0x42, 0x01, 0x0f]).unwrap_err();
        assert_eq!(error.kind, crate::ErrorKind::InvalidData);

        let mut record = HevcDecoderConfigurationRecord {
            general_profile_space: 0,
            general_tier_flag: 0,
            general_profile_idc: 1,
            general_profile_compatibility_flags: 0x6000_0000,
            general_constraint_indicator_flags: [0x90, 0, 0, 0, 0, 0],
            general_level_idc: 93,
            min_spatial_segmentation_idc: 0,
            parallelism_type: 0,
            chroma_format_idc: 1,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: 7,
            temporal_id_nested: 1,
            length_size_minus_one: 3,
            nal_arrays: Vec::new(),
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes[21], (7 << 3) | (1 << 2) | 3);

        record.num_temporal_layers = 8;
        let error = record.to_bytes().unwrap_err();
        assert_eq!(error.kind, crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn vp9_and_av1_from_codec_string() {
        let config = VpCodecConfig::from_vp9_codec_string("vp09.00.10.08", None).unwrap();
        assert_eq!(
            config.to_vpcc_payload(),
            vec![0, 10, (8 << 4) | (1 << 1), 2, 2, 2, 0, 0]
        );
        assert_eq!(
            config.to_matroska_codec_private(),
            vec![1, 1, 0, 2, 1, 10, 3, 1, 8, 4, 1, 1]
        );

        let av1c = av1_config_from_codec_string("av01.0.04M.10").unwrap();
        assert_eq!(av1c, [0x81, 0x04, 0b0100_1100, 0]);
        assert!(av1_config_from_codec_string("av01.0").is_err());
    }

    #[test]
    fn aac_config_from_codec_string() {
        assert_eq!(
            aac_audio_specific_config("mp4a.40.2", 48000, 2).unwrap(),
            vec![0x11, 0x90]
        );
        assert_eq!(
            aac_audio_specific_config("mp4a.40.2", 44100, 1).unwrap(),
            vec![0x12, 0x08]
        );
    }

    #[test]
    fn opus_head() {
        let head = OpusHead::with_defaults(2, 48000);
        let parsed = parse_opus_head(&head.to_bytes()).unwrap();
        assert_eq!(parsed, head);
        assert_eq!(
            head.to_dops_payload(),
            vec![0, 2, 0x0f, 0x00, 0, 0, 0xbb, 0x80, 0, 0, 0]
        );
        assert!(parse_opus_head(b"OpusHea").is_err());
    }

    #[test]
    fn flac_stream_info() {
        let mut data = b"fLaC".to_vec();
        data.extend_from_slice(&[0x80, 0, 0, 34]);
        let mut streaminfo = vec![0x10, 0x00, 0x10, 0x00, 0, 0, 0, 0, 0, 0];
        // 44100 Hz, 2 channels, 16 bits, 0 samples
        streaminfo.extend_from_slice(&[0x0a, 0xc4, 0x42, 0xf0, 0, 0, 0, 0]);
        streaminfo.extend_from_slice(&[0; 16]);
        data.extend_from_slice(&streaminfo);

        let header = parse_flac_header(&data).unwrap();
        assert_eq!(header.stream_info.sample_rate, 44100);
        assert_eq!(header.stream_info.channels, 2);
        assert_eq!(header.stream_info.bits_per_sample, 16);
        assert_eq!(header.to_dfla_payload(), data[4..].to_vec());
    }

    #[test]
    fn pcm_formats() {
        let format = PcmFormat::from_codec_string("pcm-s24be").unwrap();
        assert_eq!(format.sample_size, 3);
        assert!(!format.little_endian);
        assert_eq!(format.codec_string(), "pcm-s24be");
        assert_eq!(PcmFormat::from_codec_string("pcm-u8").unwrap().silent_value(), 0x80);
        assert!(PcmFormat::from_codec_string("pcm-s12").is_err());
    }

    #[test]
    fn vp9_color_space_patch() {
        // profile 0, キーフレーム, sync code, color_space = 0 (unknown)
        let mut frame = vec![0b1000_0010, 0x49, 0x83, 0x42, 0x00, 0x00];
        assert!(fix_vp9_color_space(&mut frame, MatrixCoefficients::Bt709).unwrap());
        assert_eq!(frame[4], 0b0100_0000);

        let mut inter_frame = vec![0b1000_0110, 0, 0, 0];
        assert!(!fix_vp9_color_space(&mut inter_frame, MatrixCoefficients::Bt709).unwrap());
    }
}
