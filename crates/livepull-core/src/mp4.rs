//! Init segment parsing - per-track codec strings from ISO BMFF metadata
//!
//! Boxes are a 4-byte big-endian size followed by a 4-byte type tag. A size
//! of 0 or 1 makes the box run to the end of its parent. Everything here
//! borrows the input and never copies payloads.

use crate::{types::CodecDescriptor, Error, Result};
use nom::{bytes::complete::take, number::complete::be_u32, IResult, Parser};
use serde::{Deserialize, Serialize};

/// Four-character box type
pub type BoxType = [u8; 4];

const BOX_HEADER_LEN: usize = 8;
/// Visual sample entry fields before the child boxes
const VISUAL_SAMPLE_ENTRY_LEN: usize = 78;
/// Audio sample entry fields before the child boxes
const AUDIO_SAMPLE_ENTRY_LEN: usize = 28;

/// One box at a single level of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mp4Box<'a> {
    pub box_type: BoxType,
    /// Offset of the box header within the scanned slice
    pub offset: usize,
    pub payload: &'a [u8],
}

impl Mp4Box<'_> {
    pub fn type_str(&self) -> String {
        fourcc(&self.box_type)
    }
}

/// Iterator over the boxes of one level
pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Mp4Box<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.data.len();
        if self.pos >= end {
            return None;
        }

        let Ok((_, (size, tag))) = box_header(&self.data[self.pos..]) else {
            self.pos = end;
            return None;
        };

        let start = self.pos + BOX_HEADER_LEN;
        let box_end = if size > 1 {
            self.pos.saturating_add(size as usize).min(end)
        } else {
            end
        };
        if box_end < start {
            // Declared size smaller than the header itself
            self.pos = end;
            return None;
        }

        let mut box_type = [0u8; 4];
        box_type.copy_from_slice(tag);
        let item = Mp4Box {
            box_type,
            offset: self.pos,
            payload: &self.data[start..box_end],
        };
        self.pos = box_end;
        Some(item)
    }
}

fn box_header(input: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
    (be_u32, take(4usize)).parse(input)
}

/// Iterate the boxes at the top level of `data`
pub fn iter_boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter { data, pos: 0 }
}

/// Payloads of every box matching `path`, searched recursively level by level
pub fn find_box<'a>(data: &'a [u8], path: &[&BoxType]) -> Vec<&'a [u8]> {
    let mut results = Vec::new();
    let Some((first, rest)) = path.split_first() else {
        return results;
    };

    for found in iter_boxes(data).filter(|b| &b.box_type == *first) {
        if rest.is_empty() {
            results.push(found.payload);
        } else {
            results.extend(find_box(found.payload, rest));
        }
    }
    results
}

fn first_box<'a>(data: &'a [u8], path: &[&BoxType]) -> Option<&'a [u8]> {
    find_box(data, path).into_iter().next()
}

/// Track classification from the handler box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Default sample values from `trex`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDefaults {
    pub sample_duration: u32,
    pub sample_flags: u32,
}

/// One audio or video track of an init segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: u32,
    pub kind: TrackKind,
    pub timescale: u32,
    /// Codec string, e.g. `avc1.64001F`
    pub codec: String,
    /// Sample entry was wrapped in `enca`/`encv`
    pub encrypted: bool,
    pub defaults: Option<TrackDefaults>,
}

/// Parsed init segment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    pub audio: Option<TrackInfo>,
    pub video: Option<TrackInfo>,
}

impl InitData {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackInfo> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Codec strings for the sink MIME type
    pub fn codecs(&self) -> CodecDescriptor {
        CodecDescriptor {
            audio_codec: self.audio.as_ref().map(|t| t.codec.clone()).unwrap_or_default(),
            video_codec: self.video.as_ref().map(|t| t.codec.clone()).unwrap_or_default(),
        }
    }
}

/// Extract audio/video track information from an init segment.
///
/// Tracks whose handler is neither `soun` nor `vide`, or that lack a
/// `tkhd`/`mdhd`/`hdlr`, are skipped. A classified track with an unreadable
/// sample description is an error.
pub fn parse_init_segment(data: &[u8]) -> Result<InitData> {
    let mut result = InitData::default();

    for trak in find_box(data, &[b"moov", b"trak"]) {
        let Some(tkhd) = first_box(trak, &[b"tkhd"]) else {
            continue;
        };
        let id = read_u32(tkhd, versioned_offset(tkhd), "tkhd")?;

        let Some(mdhd) = first_box(trak, &[b"mdia", b"mdhd"]) else {
            continue;
        };
        let timescale = read_u32(mdhd, versioned_offset(mdhd), "mdhd")?;

        let Some(hdlr) = first_box(trak, &[b"mdia", b"hdlr"]) else {
            continue;
        };
        let kind = match hdlr.get(8..12) {
            Some(b"soun") => TrackKind::Audio,
            Some(b"vide") => TrackKind::Video,
            _ => continue,
        };

        let stsd = first_box(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])
            .ok_or_else(|| Error::MissingBox("stsd".into()))?;
        let (codec, encrypted) = parse_stsd(stsd)?;

        let track = TrackInfo {
            id,
            kind,
            timescale,
            codec,
            encrypted,
            defaults: None,
        };
        match kind {
            TrackKind::Audio => result.audio = Some(track),
            TrackKind::Video => result.video = Some(track),
        }
    }

    for trex in find_box(data, &[b"moov", b"mvex", b"trex"]) {
        let (Ok(track_id), Ok(sample_duration), Ok(sample_flags)) = (
            read_u32(trex, 4, "trex"),
            read_u32(trex, 12, "trex"),
            read_u32(trex, 20, "trex"),
        ) else {
            continue;
        };

        for track in [result.audio.as_mut(), result.video.as_mut()].into_iter().flatten() {
            if track.id == track_id {
                track.defaults = Some(TrackDefaults {
                    sample_duration,
                    sample_flags,
                });
            }
        }
    }

    Ok(result)
}

/// Offset of the field after creation/modification times in a full box
fn versioned_offset(full_box: &[u8]) -> usize {
    match full_box.first() {
        Some(0) => 12,
        _ => 20,
    }
}

/// Codec string and encryption flag from a sample description box
fn parse_stsd(stsd: &[u8]) -> Result<(String, bool)> {
    let entries = stsd
        .get(8..)
        .ok_or_else(|| Error::malformed("stsd", "missing entry count"))?;
    let entry_type = entries
        .get(4..8)
        .map(fourcc)
        .ok_or_else(|| Error::malformed("stsd", "missing sample entry"))?;
    let children = entries
        .get(BOX_HEADER_LEN + VISUAL_SAMPLE_ENTRY_LEN..)
        .unwrap_or_default();

    let encrypted = entry_type == "enca" || entry_type == "encv";
    let mut codec = entry_type.clone();
    if encrypted {
        if let Some(original) = original_format(entries, &entry_type) {
            codec = original;
        }
    }

    let codec = match codec.as_str() {
        "avc1" | "avc2" | "avc3" | "avc4" => {
            let avcc = config_box(children, b"avcC")?;
            format!(
                "{}.{:02X}{:02X}{:02X}",
                codec,
                read_u8(avcc, 1, "avcC")?,
                read_u8(avcc, 2, "avcC")?,
                read_u8(avcc, 3, "avcC")?
            )
        }
        "mp4a" => {
            let entry = first_box(entries, &[&box_type(&entry_type)])
                .ok_or_else(|| Error::MissingBox(entry_type.clone()))?;
            let entry_children = entry.get(AUDIO_SAMPLE_ENTRY_LEN..).unwrap_or_default();
            match first_box(entry_children, &[b"esds"]) {
                Some(esds) if esds.len() > 7 => {
                    let mut codec = codec;
                    append_aac_suffix(esds, &mut codec);
                    codec
                }
                _ => codec,
            }
        }
        "hvc1" | "hev1" => hevc_codec(&codec, config_box(children, b"hvcC")?)?,
        "dvh1" | "dvhe" => {
            let dvcc = config_box(children, b"dvcC")?;
            let b2 = u32::from(read_u8(dvcc, 2, "dvcC")?);
            let b3 = u32::from(read_u8(dvcc, 3, "dvcC")?);
            let profile = (b2 >> 1) & 0x7f;
            let level = ((b2 << 5) & 0x20) | ((b3 >> 3) & 0x1f);
            format!("{}.{:02}.{:02}", codec, profile, level)
        }
        "vp09" => {
            let vpcc = config_box(children, b"vpcC")?;
            let profile = read_u8(vpcc, 4, "vpcC")?;
            let level = read_u8(vpcc, 5, "vpcC")?;
            let bit_depth = (read_u8(vpcc, 6, "vpcC")? >> 4) & 0x0f;
            format!("{}.{:02}.{:02}.{:02}", codec, profile, level, bit_depth)
        }
        "av01" => av1_codec(&codec, config_box(children, b"av1C")?)?,
        _ => codec,
    };

    Ok((codec, encrypted))
}

/// Original format of an `enca`/`encv` entry, from its protection scheme info
fn original_format(entries: &[u8], entry_type: &str) -> Option<String> {
    let enc_box = first_box(entries, &[&box_type(entry_type)])?;
    let skip = if entry_type == "enca" {
        AUDIO_SAMPLE_ENTRY_LEN
    } else {
        VISUAL_SAMPLE_ENTRY_LEN
    };
    let children = enc_box.get(skip..)?;

    let mut original = None;
    for sinf in find_box(children, &[b"sinf"]) {
        let Some(schm) = first_box(sinf, &[b"schm"]) else {
            continue;
        };
        if matches!(schm.get(4..8), Some(b"cbcs") | Some(b"cenc")) {
            if let Some(frma) = first_box(sinf, &[b"frma"]) {
                original = Some(fourcc(frma));
            }
        }
    }
    original
}

/// Appends `.40.<audio object type>` from an `esds` payload. Stops early,
/// keeping whatever was appended, when the descriptor chain is not the
/// expected MPEG-4 audio one.
fn append_aac_suffix(esds: &[u8], codec: &mut String) -> Option<()> {
    let mut i = 4;

    // ES descriptor
    if *esds.get(i)? != 0x03 {
        return None;
    }
    i = skip_ber_integer(esds, i + 1);
    i += 2; // ES_ID
    let flags = *esds.get(i)?;
    i += 1;
    if flags & 0x80 != 0 {
        i += 2; // depends-on ES_ID
    }
    if flags & 0x40 != 0 {
        i += 1 + usize::from(*esds.get(i)?); // URL
    }

    // Decoder config descriptor
    if *esds.get(i)? != 0x04 {
        return None;
    }
    i = skip_ber_integer(esds, i + 1);
    let object_type = *esds.get(i)?;
    i += 1;
    if object_type != 0x40 {
        return None;
    }
    codec.push_str(&format!(".{:02X}", object_type));
    i += 12;

    // Decoder specific info
    if *esds.get(i)? != 0x05 {
        return None;
    }
    i = skip_ber_integer(esds, i + 1);
    let first = u32::from(*esds.get(i)?);
    i += 1;
    let mut audio_object_type = (first & 0xf8) >> 3;
    if audio_object_type == 31 {
        let next = u32::from(*esds.get(i)?);
        audio_object_type += 1 + ((first & 0x7) << 3) + ((next & 0xe0) >> 5);
    }
    codec.push_str(&format!(".{}", audio_object_type));
    Some(())
}

/// Skip a BER length (at most 4 bytes) and return the index after it
fn skip_ber_integer(bytes: &[u8], mut i: usize) -> usize {
    let limit = i + 5;
    loop {
        let byte = bytes.get(i).copied().unwrap_or(0);
        i += 1;
        if byte & 0x80 == 0 || i >= limit {
            return i;
        }
    }
}

fn hevc_codec(codec: &str, hvcc: &[u8]) -> Result<String> {
    let profile_byte = read_u8(hvcc, 1, "hvcC")?;
    let profile_space = ["", "A", "B", "C"][usize::from(profile_byte >> 6)];
    let general_profile_idc = profile_byte & 0x1f;
    let profile_compat = read_u32(hvcc, 2, "hvcC")?;
    let tier = if (profile_byte & 0x20) >> 5 != 0 { 'H' } else { 'L' };
    let level_idc = read_u8(hvcc, 12, "hvcC")?;
    let constraints = hvcc
        .get(6..12)
        .ok_or_else(|| Error::malformed("hvcC", "truncated constraint flags"))?;

    let mut out = format!(
        "{}.{}{}.{:X}.{}{}",
        codec, profile_space, general_profile_idc, profile_compat, tier, level_idc
    );

    // Trailing zero bytes are dropped; interior ones are kept
    let mut suffix = String::new();
    for &byte in constraints.iter().rev() {
        if byte != 0 || !suffix.is_empty() {
            suffix = format!(".{:X}{}", byte, suffix);
        }
    }
    out.push_str(&suffix);
    Ok(out)
}

fn av1_codec(codec: &str, av1c: &[u8]) -> Result<String> {
    let b1 = read_u8(av1c, 1, "av1C")?;
    let b2 = read_u8(av1c, 2, "av1C")?;

    let profile = b1 >> 5;
    let level = b1 & 0x1f;
    let tier = if b2 >> 7 != 0 { 'H' } else { 'M' };
    let high_bit_depth = (b2 & 0x40) >> 6;
    let twelve_bit = (b2 & 0x20) >> 5;
    let bit_depth = match (profile, high_bit_depth, twelve_bit) {
        (2, 1, 1) => 12,
        (2, 1, 0) => 10,
        (_, 1, _) => 10,
        _ => 8,
    };
    let monochrome = (b2 & 0x10) >> 4;
    let subsampling_x = (b2 & 0x08) >> 3;
    let subsampling_y = (b2 & 0x04) >> 2;
    let sample_position = b2 & 0x03;

    // Colour description is not read; BT.709 limited range is assumed
    let (color_primaries, transfer, matrix, full_range) = (1, 1, 1, 0);

    Ok(format!(
        "{}.{}.{:02}{}.{:02}.{}.{}{}{}.{:02}.{:02}.{:02}.{}",
        codec,
        profile,
        level,
        tier,
        bit_depth,
        monochrome,
        subsampling_x,
        subsampling_y,
        sample_position,
        color_primaries,
        transfer,
        matrix,
        full_range
    ))
}

fn config_box<'a>(children: &'a [u8], tag: &BoxType) -> Result<&'a [u8]> {
    first_box(children, &[tag]).ok_or_else(|| Error::MissingBox(fourcc(tag)))
}

fn read_u8(data: &[u8], offset: usize, box_name: &str) -> Result<u8> {
    data.get(offset)
        .copied()
        .ok_or_else(|| Error::malformed(box_name, format!("truncated at byte {}", offset)))
}

fn read_u32(data: &[u8], offset: usize, box_name: &str) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::malformed(box_name, format!("truncated at byte {}", offset)))
}

fn box_type(tag: &str) -> BoxType {
    let mut out = [b' '; 4];
    for (slot, byte) in out.iter_mut().zip(tag.bytes()) {
        *slot = byte;
    }
    out
}

/// Box tags are bytes; map each one to the matching Latin-1 char
fn fourcc(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
