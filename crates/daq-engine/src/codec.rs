//! Raw-code ↔ engineering-unit conversion and multi-channel packing.
//!
//! Hardware delivers samples as raw integer words whose significant bits may
//! be offset-coded (two's complement with the sign bit flipped) and
//! left-justified inside a wider word. A [`ChannelCoding`] describes how to get
//! from such a raw word to a straight-binary code in `[0, 2^bits - 1]`:
//!
//! ```text
//! code = (((raw & and_mask) ^ xor_mask) >> shift) & (2^bits - 1)
//! ```
//!
//! The code is then mapped linearly onto a [`Range`]. Conversions are total:
//! every raw word and every `f64` converts. The only failures are malformed
//! metadata, reported once at configuration time.
//!
//! Generation hardware expects multiple channels packed into 32-bit words.
//! [`PackingPolicy`] names the supported conventions; new conventions belong
//! here and nowhere else.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Largest supported resolution. Codes stay exactly representable in `f64`.
pub const MAX_RESOLUTION_BITS: u32 = 24;

/// Mask of the code field in a channel-tagged word.
pub const TAGGED_CODE_MASK: u32 = 0xFFFF;

/// Bits per channel in a co-packed pair word.
pub const CO_PACKED_BITS: u32 = 12;

/// Mask of one channel's code in a co-packed pair word.
pub const CO_PACKED_MASK: u32 = (1 << CO_PACKED_BITS) - 1;

/// Smallest slack (in code units) added before flooring.
const MIN_FLOOR_TOLERANCE: f64 = 1e-6;

/// Multiple of the rounding error bound used as flooring slack.
const FLOOR_ERROR_FACTOR: f64 = 16.0;

/// Engineering-unit range for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Value of code 0
    pub min: f64,
    /// Value of the all-ones code
    pub max: f64,
}

impl Default for Range {
    fn default() -> Self {
        Self {
            min: -10.0,
            max: 10.0,
        }
    }
}

impl Range {
    /// Create a validated range.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    /// Reject empty or non-finite ranges.
    pub fn validate(&self) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(EngineError::codec(format!(
                "range bounds must be finite, got [{}, {}]",
                self.min, self.max
            )));
        }
        if self.min == self.max {
            return Err(EngineError::codec(format!(
                "range low and high are both {}",
                self.min
            )));
        }
        Ok(())
    }

    /// Get the span (max - min) of this range.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// How a channel's raw hardware word maps to a straight-binary code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCoding {
    resolution_bits: u32,
    and_mask: u32,
    xor_mask: u32,
    shift: u32,
}

impl Default for ChannelCoding {
    fn default() -> Self {
        Self {
            resolution_bits: 16,
            and_mask: 0xFFFF,
            xor_mask: 0,
            shift: 0,
        }
    }
}

impl ChannelCoding {
    /// Create a coding from explicit masks.
    ///
    /// `shift` is the number of low bits dropped after masking, used when the
    /// hardware left-justifies a narrow code inside a wider word.
    pub fn new(resolution_bits: u32, and_mask: u32, xor_mask: u32, shift: u32) -> Result<Self> {
        let coding = Self {
            resolution_bits,
            and_mask,
            xor_mask,
            shift,
        };
        coding.validate()?;
        Ok(coding)
    }

    /// Straight binary: raw word already is the code.
    pub fn straight_binary(resolution_bits: u32) -> Result<Self> {
        let mask = max_code_for(resolution_bits)?;
        Self::new(resolution_bits, mask, 0, 0)
    }

    /// Two's-complement hardware codes, converted by flipping the sign bit.
    pub fn twos_complement(resolution_bits: u32) -> Result<Self> {
        let mask = max_code_for(resolution_bits)?;
        Self::new(resolution_bits, mask, 1 << (resolution_bits - 1), 0)
    }

    /// Two's-complement codes left-justified in a `word_bits` wide word.
    pub fn left_justified(resolution_bits: u32, word_bits: u32) -> Result<Self> {
        if word_bits < resolution_bits || word_bits > 32 {
            return Err(EngineError::codec(format!(
                "cannot left-justify {}-bit codes in a {}-bit word",
                resolution_bits, word_bits
            )));
        }
        let mask = max_code_for(resolution_bits)?;
        let shift = word_bits - resolution_bits;
        Self::new(
            resolution_bits,
            mask << shift,
            1 << (word_bits - 1),
            shift,
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        max_code_for(self.resolution_bits)?;
        if self.shift + self.resolution_bits > 32 {
            return Err(EngineError::codec(format!(
                "shift {} leaves no room for {} bits in a 32-bit word",
                self.shift, self.resolution_bits
            )));
        }
        Ok(())
    }

    /// Resolution in bits.
    pub fn resolution_bits(&self) -> u32 {
        self.resolution_bits
    }

    /// Significant bits of the raw hardware word (resolution plus alignment shift).
    pub fn raw_bits(&self) -> u32 {
        self.resolution_bits + self.shift
    }

    /// The all-ones code, `2^bits - 1`.
    pub fn max_code(&self) -> u32 {
        (1u32 << self.resolution_bits) - 1
    }

    /// Convert a raw hardware word to a straight-binary code.
    pub fn normalize(&self, raw: u32) -> u32 {
        (((raw & self.and_mask) ^ self.xor_mask) >> self.shift) & self.max_code()
    }

    /// Convert a straight-binary code back to a raw hardware word.
    pub fn denormalize(&self, code: u32) -> u32 {
        (((code & self.max_code()) << self.shift) ^ self.xor_mask) & self.and_mask
    }
}

fn max_code_for(resolution_bits: u32) -> Result<u32> {
    if resolution_bits == 0 || resolution_bits > MAX_RESOLUTION_BITS {
        return Err(EngineError::codec(format!(
            "resolution must be 1..={} bits, got {}",
            MAX_RESOLUTION_BITS, resolution_bits
        )));
    }
    Ok((1u32 << resolution_bits) - 1)
}

/// Convert a raw hardware word to engineering units.
///
/// Code 0 maps exactly to `range.min` and the all-ones code exactly to
/// `range.max`.
pub fn raw_to_units(raw: u32, coding: &ChannelCoding, range: &Range) -> f64 {
    let code = coding.normalize(raw);
    let max_code = coding.max_code();
    if code == max_code {
        return range.max;
    }
    range.min + f64::from(code) * range.span() / f64::from(max_code)
}

/// Convert engineering units to a straight-binary code in `[0, 2^bits - 1]`.
///
/// The inverse of the linear map, floored and clamped. NaN maps to code 0.
pub fn units_to_raw(value: f64, coding: &ChannelCoding, range: &Range) -> u32 {
    let max_code = coding.max_code();
    if value.is_nan() {
        return 0;
    }
    let scaled = (value - range.min) / range.span() * f64::from(max_code);
    let floored = (scaled + floor_tolerance(max_code, range)).floor();
    if floored <= 0.0 {
        0
    } else if floored >= f64::from(max_code) {
        max_code
    } else {
        floored as u32
    }
}

/// Slack that lets every exact code survive a round trip.
///
/// `raw_to_units` rounds relative to the larger bound, so on a range far from
/// zero the error in code units grows with `(|min| + |max|) / span`.
fn floor_tolerance(max_code: u32, range: &Range) -> f64 {
    let magnitude = range.min.abs() + range.max.abs();
    let bound = f64::EPSILON * f64::from(max_code) * magnitude / range.span().abs();
    (FLOOR_ERROR_FACTOR * bound).max(MIN_FLOOR_TOLERANCE)
}

/// Coding plus range for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelEncoding {
    /// Raw-word coding
    pub coding: ChannelCoding,
    /// Engineering-unit range
    pub range: Range,
}

impl ChannelEncoding {
    /// Create a validated encoding.
    pub fn new(coding: ChannelCoding, range: Range) -> Result<Self> {
        coding.validate()?;
        range.validate()?;
        Ok(Self { coding, range })
    }

    /// Raw hardware word to engineering units.
    pub fn to_units(&self, raw: u32) -> f64 {
        raw_to_units(raw, &self.coding, &self.range)
    }

    /// Engineering units to a raw hardware word.
    pub fn to_raw_word(&self, value: f64) -> u32 {
        self.coding
            .denormalize(units_to_raw(value, &self.coding, &self.range))
    }
}

/// Multi-channel word packing conventions for generation hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingPolicy {
    /// One word per sample, no channel information
    #[default]
    Plain,
    /// One word per sample: channel id in bits 16-31, code in bits 0-15
    ChannelTagged,
    /// Two ≤12-bit codes per word: first channel in bits 0-11, second in bits 12-23
    CoPackedPair,
}

/// Samples recovered from packed words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unpacked {
    /// Codes in packing order
    pub codes: Vec<u32>,
    /// Channel id of each code (empty for [`PackingPolicy::Plain`])
    pub channel_ids: Vec<u32>,
}

/// Pack codes into words.
///
/// `channel_ids[i]` names the channel of `codes[i]`. Values that do not fit the
/// policy's fields are rejected, so packing never loses information.
pub fn pack_channels(codes: &[u32], channel_ids: &[u32], policy: PackingPolicy) -> Result<Vec<u32>> {
    if codes.is_empty() {
        return Err(EngineError::codec("nothing to pack: empty code list"));
    }
    if codes.len() != channel_ids.len() {
        return Err(EngineError::codec(format!(
            "{} codes but {} channel ids",
            codes.len(),
            channel_ids.len()
        )));
    }

    match policy {
        PackingPolicy::Plain => Ok(codes.to_vec()),
        PackingPolicy::ChannelTagged => codes
            .iter()
            .zip(channel_ids)
            .map(|(&code, &id)| {
                if code > TAGGED_CODE_MASK || id > 0xFFFF {
                    Err(EngineError::codec(format!(
                        "channel {} code {:#x} does not fit a tagged word",
                        id, code
                    )))
                } else {
                    Ok((id << 16) | code)
                }
            })
            .collect(),
        PackingPolicy::CoPackedPair => {
            if codes.len() % 2 != 0 {
                return Err(EngineError::codec(format!(
                    "co-packed pairs need an even code count, got {}",
                    codes.len()
                )));
            }
            codes
                .chunks_exact(2)
                .zip(channel_ids.chunks_exact(2))
                .map(|(pair, ids)| {
                    if ids != [0, 1] {
                        return Err(EngineError::codec(format!(
                            "co-packed pair must hold channels [0, 1], got {:?}",
                            ids
                        )));
                    }
                    if pair[0] > CO_PACKED_MASK || pair[1] > CO_PACKED_MASK {
                        return Err(EngineError::codec(format!(
                            "codes {:?} exceed {} bits",
                            pair, CO_PACKED_BITS
                        )));
                    }
                    Ok(pair[0] | (pair[1] << CO_PACKED_BITS))
                })
                .collect()
        }
    }
}

/// Recover codes (and channel ids, where the policy carries them) from words.
pub fn unpack_channels(words: &[u32], policy: PackingPolicy) -> Unpacked {
    match policy {
        PackingPolicy::Plain => Unpacked {
            codes: words.to_vec(),
            channel_ids: Vec::new(),
        },
        PackingPolicy::ChannelTagged => Unpacked {
            codes: words.iter().map(|w| w & TAGGED_CODE_MASK).collect(),
            channel_ids: words.iter().map(|w| w >> 16).collect(),
        },
        PackingPolicy::CoPackedPair => {
            let mut unpacked = Unpacked {
                codes: Vec::with_capacity(words.len() * 2),
                channel_ids: Vec::with_capacity(words.len() * 2),
            };
            for w in words {
                unpacked.codes.push(w & CO_PACKED_MASK);
                unpacked.codes.push((w >> CO_PACKED_BITS) & CO_PACKED_MASK);
                unpacked.channel_ids.extend([0, 1]);
            }
            unpacked
        }
    }
}

/// A packing layout validated once against a channel list.
///
/// Packs scan-interleaved codes without further checks, so nothing fails
/// mid-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPacker {
    policy: PackingPolicy,
    channel_ids: Vec<u32>,
    code_mask: u32,
}

impl ChannelPacker {
    /// Validate `policy` for the given channels and raw word width.
    ///
    /// `raw_bits` is the number of significant bits in a hardware word
    /// (see [`ChannelCoding::raw_bits`]).
    pub fn new(policy: PackingPolicy, channel_ids: &[u32], raw_bits: u32) -> Result<Self> {
        if channel_ids.is_empty() {
            return Err(EngineError::codec("packing needs at least one channel"));
        }
        if raw_bits == 0 || raw_bits > 32 {
            return Err(EngineError::codec(format!(
                "raw words must be 1..=32 bits, got {}",
                raw_bits
            )));
        }

        match policy {
            PackingPolicy::Plain => {}
            PackingPolicy::ChannelTagged => {
                if raw_bits > 16 {
                    return Err(EngineError::codec(format!(
                        "channel-tagged words carry at most 16-bit codes, got {}",
                        raw_bits
                    )));
                }
                if let Some(id) = channel_ids.iter().find(|&&id| id > 0xFFFF) {
                    return Err(EngineError::codec(format!(
                        "channel id {} does not fit a 16-bit tag",
                        id
                    )));
                }
            }
            PackingPolicy::CoPackedPair => {
                if channel_ids.len() != 2 {
                    return Err(EngineError::codec(format!(
                        "co-packed pairs need exactly 2 channels, got {}",
                        channel_ids.len()
                    )));
                }
                if raw_bits > CO_PACKED_BITS {
                    return Err(EngineError::codec(format!(
                        "co-packed pairs carry at most {}-bit codes, got {}",
                        CO_PACKED_BITS, raw_bits
                    )));
                }
            }
        }

        Ok(Self {
            policy,
            channel_ids: channel_ids.to_vec(),
            code_mask: u32::MAX >> (32 - raw_bits),
        })
    }

    /// The packing policy.
    pub fn policy(&self) -> PackingPolicy {
        self.policy
    }

    /// Number of packed words one scan occupies.
    pub fn words_per_scan(&self) -> usize {
        match self.policy {
            PackingPolicy::CoPackedPair => 1,
            PackingPolicy::Plain | PackingPolicy::ChannelTagged => self.channel_ids.len(),
        }
    }

    /// Pack scan-interleaved codes, appending to `out`.
    ///
    /// A trailing partial scan is ignored.
    pub fn pack_scans(&self, codes: &[u32], out: &mut Vec<u32>) {
        let n = self.channel_ids.len();
        for scan in codes.chunks_exact(n) {
            match self.policy {
                PackingPolicy::Plain => out.extend(scan.iter().map(|c| c & self.code_mask)),
                PackingPolicy::ChannelTagged => out.extend(
                    scan.iter()
                        .zip(&self.channel_ids)
                        .map(|(c, id)| (id << 16) | (c & self.code_mask)),
                ),
                PackingPolicy::CoPackedPair => out.push(
                    (scan[0] & self.code_mask) | ((scan[1] & self.code_mask) << CO_PACKED_BITS),
                ),
            }
        }
    }

    /// Recover scan-interleaved codes from packed words.
    pub fn unpack_scans(&self, words: &[u32]) -> Vec<u32> {
        unpack_channels(words, self.policy).codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twelve_bit() -> (ChannelCoding, Range) {
        (
            ChannelCoding::straight_binary(12).unwrap(),
            Range::new(-10.0, 10.0).unwrap(),
        )
    }

    #[test]
    fn test_corner_codes_are_exact() {
        let (coding, range) = twelve_bit();
        assert_eq!(raw_to_units(0, &coding, &range), -10.0);
        assert_eq!(raw_to_units(4095, &coding, &range), 10.0);

        let unipolar = Range::new(0.1, 0.3).unwrap();
        assert_eq!(raw_to_units(4095, &coding, &unipolar), 0.3);
        assert_eq!(raw_to_units(0, &coding, &unipolar), 0.1);
    }

    #[test]
    fn test_twelve_bit_bipolar_scenario() {
        let (coding, range) = twelve_bit();
        let lsb = range.span() / 4096.0;
        let units: Vec<f64> = [0, 2047, 4095, 2048]
            .iter()
            .map(|&raw| raw_to_units(raw, &coding, &range))
            .collect();

        assert_eq!(units[0], -10.0);
        assert!((units[1] - -0.0049).abs() < lsb, "got {}", units[1]);
        assert_eq!(units[2], 10.0);
        assert!(units[3].abs() < lsb, "got {}", units[3]);
        // Codes either side of mid-scale straddle zero
        assert!(units[1] < 0.0 && units[3] > 0.0);
    }

    #[test]
    fn test_units_to_raw_clamps() {
        let (coding, range) = twelve_bit();
        assert_eq!(units_to_raw(-50.0, &coding, &range), 0);
        assert_eq!(units_to_raw(50.0, &coding, &range), 4095);
        assert_eq!(units_to_raw(f64::NAN, &coding, &range), 0);
        assert_eq!(units_to_raw(f64::INFINITY, &coding, &range), 4095);
        assert_eq!(units_to_raw(f64::NEG_INFINITY, &coding, &range), 0);
    }

    #[test]
    fn test_round_trip_every_twelve_bit_code() {
        let (coding, range) = twelve_bit();
        for code in 0..=coding.max_code() {
            let units = raw_to_units(code, &coding, &range);
            assert_eq!(units_to_raw(units, &coding, &range), code, "code {}", code);
        }
    }

    #[test]
    fn test_round_trip_wide_codes_on_offset_ranges() {
        let coding = ChannelCoding::straight_binary(MAX_RESOLUTION_BITS).unwrap();
        let max_code = coding.max_code();
        for (min, max) in [(-100.0, -99.9), (1000.0, 1000.5), (199.9, 200.0)] {
            let range = Range::new(min, max).unwrap();
            for code in (0..=max_code).step_by(997).chain([1, 17, max_code]) {
                let units = raw_to_units(code, &coding, &range);
                assert_eq!(
                    units_to_raw(units, &coding, &range),
                    code,
                    "code {} on [{}, {}]",
                    code,
                    min,
                    max
                );
            }
        }
    }

    #[test]
    fn test_twos_complement_coding() {
        let coding = ChannelCoding::twos_complement(16).unwrap();
        // Most negative two's-complement value is the bottom of the range
        assert_eq!(coding.normalize(0x8000), 0);
        assert_eq!(coding.normalize(0x0000), 0x8000);
        assert_eq!(coding.normalize(0x7FFF), 0xFFFF);
        for code in [0, 1, 0x7FFF, 0x8000, 0xFFFF] {
            assert_eq!(coding.normalize(coding.denormalize(code)), code);
        }
    }

    #[test]
    fn test_left_justified_coding() {
        // 12-bit two's complement in the top of a 16-bit word
        let coding = ChannelCoding::left_justified(12, 16).unwrap();
        assert_eq!(coding.normalize(0x8000), 0);
        assert_eq!(coding.normalize(0x7FF0), 0xFFF);
        // Low nibble is noise and ignored
        assert_eq!(coding.normalize(0x000F), 0x800);
        assert_eq!(coding.denormalize(0x800), 0x0000);
    }

    #[test]
    fn test_conversion_is_total_over_raw_domain() {
        let coding = ChannelCoding::straight_binary(12).unwrap();
        let range = Range::default();
        for raw in [u32::MAX, 0xFFFF_F000, 0x1000, 0xDEAD_BEEF] {
            let units = raw_to_units(raw, &coding, &range);
            assert!(units >= range.min && units <= range.max);
        }
    }

    #[test]
    fn test_metadata_errors() {
        assert!(ChannelCoding::straight_binary(0).unwrap_err().is_configuration());
        assert!(ChannelCoding::straight_binary(MAX_RESOLUTION_BITS + 1).is_err());
        assert!(ChannelCoding::new(16, 0xFFFF, 0, 20).is_err());
        assert!(ChannelCoding::left_justified(16, 12).is_err());
        assert!(Range::new(5.0, 5.0).is_err());
        assert!(Range::new(f64::NAN, 5.0).is_err());
        assert!(ChannelPacker::new(PackingPolicy::Plain, &[], 12).is_err());
    }

    #[test]
    fn test_channel_tagged_packing() {
        let words = pack_channels(&[0x123, 0xFFFF], &[3, 17], PackingPolicy::ChannelTagged).unwrap();
        assert_eq!(words, vec![0x0003_0123, 0x0011_FFFF]);

        let unpacked = unpack_channels(&words, PackingPolicy::ChannelTagged);
        assert_eq!(unpacked.codes, vec![0x123, 0xFFFF]);
        assert_eq!(unpacked.channel_ids, vec![3, 17]);

        assert!(pack_channels(&[0x1_0000], &[0], PackingPolicy::ChannelTagged).is_err());
    }

    #[test]
    fn test_co_packed_pair_packing() {
        let words = pack_channels(&[0xABC, 0x123], &[0, 1], PackingPolicy::CoPackedPair).unwrap();
        assert_eq!(words, vec![0x0012_3ABC]);

        let unpacked = unpack_channels(&words, PackingPolicy::CoPackedPair);
        assert_eq!(unpacked.codes, vec![0xABC, 0x123]);
        assert_eq!(unpacked.channel_ids, vec![0, 1]);

        assert!(pack_channels(&[1, 2, 3], &[0, 1, 0], PackingPolicy::CoPackedPair).is_err());
        assert!(pack_channels(&[1, 2], &[1, 0], PackingPolicy::CoPackedPair).is_err());
        assert!(pack_channels(&[0x1000, 0], &[0, 1], PackingPolicy::CoPackedPair).is_err());
    }

    #[test]
    fn test_packer_validation() {
        assert!(ChannelPacker::new(PackingPolicy::CoPackedPair, &[0, 1, 2], 12).is_err());
        assert!(ChannelPacker::new(PackingPolicy::CoPackedPair, &[0, 1], 14).is_err());
        assert!(ChannelPacker::new(PackingPolicy::ChannelTagged, &[0], 18).is_err());
        assert!(ChannelPacker::new(PackingPolicy::ChannelTagged, &[0x1_0000], 16).is_err());
        assert!(ChannelPacker::new(PackingPolicy::Plain, &[0, 1, 2], 18).is_ok());
        assert!(ChannelPacker::new(PackingPolicy::Plain, &[0], 0).is_err());

        let left_justified = ChannelCoding::left_justified(12, 16).unwrap();
        assert_eq!(left_justified.raw_bits(), 16);
        assert!(ChannelPacker::new(
            PackingPolicy::CoPackedPair,
            &[0, 1],
            left_justified.raw_bits()
        )
        .is_err());
    }

    #[test]
    fn test_packer_scans() {
        let packer = ChannelPacker::new(PackingPolicy::CoPackedPair, &[0, 1], 12).unwrap();
        assert_eq!(packer.words_per_scan(), 1);

        let codes = [1, 2, 3, 4, 5, 6];
        let mut words = Vec::new();
        packer.pack_scans(&codes, &mut words);
        assert_eq!(words.len(), 3);
        assert_eq!(packer.unpack_scans(&words), codes.to_vec());

        let tagged = ChannelPacker::new(PackingPolicy::ChannelTagged, &[4, 9], 16).unwrap();
        let mut words = Vec::new();
        tagged.pack_scans(&[10, 20, 30, 40], &mut words);
        assert_eq!(words, vec![0x4_000A, 0x9_0014, 0x4_001E, 0x9_0028]);
    }

    #[test]
    fn test_encoding_raw_word() {
        let encoding = ChannelEncoding::new(
            ChannelCoding::twos_complement(16).unwrap(),
            Range::default(),
        )
        .unwrap();
        assert_eq!(encoding.to_raw_word(-10.0), 0x8000);
        assert_eq!(encoding.to_raw_word(10.0), 0x7FFF);
        assert_eq!(encoding.to_units(0x8000), -10.0);
    }
}
