//! Binary wire codec for the out-of-band (OOB) negotiation message family
//! (§4.A). Every message starts with a one-byte version and a one-byte
//! message type, followed by a body whose shape depends on the type.
//! Per-technology blocks (`TechCapability`/`TechConfig`) are self-describing
//! — `{tech_id: u8, block_size: u8, payload: [u8; block_size - 2]}` — so a
//! peer that doesn't recognize a `tech_id` can still skip over the block and
//! parse the rest of the message.
//!
//! This crate hand-rolls the byte parsing rather than reaching for a framing
//! crate: the message family is small, fixed, and needs exact control over
//! truncation/validation errors for the decode testable properties, which a
//! generic (de)serializer would obscure behind its own error type.

use crate::error::CodecError;
use crate::model::{
    CsCapability, CsConfig, DeviceMode, DeviceRole, RssiCapability, RssiConfig, RttCapability,
    RttConfig, TechCapability, TechConfig, TechnologyTag, UwbCapability, UwbConfig,
};

/// Only version currently understood by this implementation.
pub const CURRENT_VERSION: u8 = 0x00;

/// Bitmap of all `TechnologyTag` bits; any bit outside this mask is unknown.
const ALL_TECH_BITS: u16 = 0b1111;

// ─── TechSet — wire bitmap over TechnologyTag ───────────────────────────────

/// A bitmap of technologies, as carried directly on the wire (distinct from
/// `model::TechSetValue`, which backs the in-memory `OobRangingConstraints`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TechSet(u16);

impl TechSet {
    pub const EMPTY: TechSet = TechSet(0);

    pub fn from_bits(bits: u16) -> Result<Self, CodecError> {
        if bits & !ALL_TECH_BITS != 0 {
            Err(CodecError::UnknownBits(bits))
        } else {
            Ok(TechSet(bits))
        }
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, tag: TechnologyTag) -> bool {
        self.0 & (1 << tag.bit_index()) != 0
    }

    pub fn insert(&mut self, tag: TechnologyTag) {
        self.0 |= 1 << tag.bit_index();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TechnologyTag> + '_ {
        TechnologyTag::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<TechnologyTag> for TechSet {
    fn from_iter<I: IntoIterator<Item = TechnologyTag>>(iter: I) -> Self {
        let mut set = TechSet::EMPTY;
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

// ─── Message family ──────────────────────────────────────────────────────────

const MSG_CAPABILITY_REQUEST: u8 = 0x00;
const MSG_CAPABILITY_RESPONSE: u8 = 0x01;
const MSG_SET_CONFIGURATION: u8 = 0x02;
const MSG_SET_CONFIGURATION_RESPONSE: u8 = 0x03;
const MSG_START_RANGING: u8 = 0x04;
const MSG_START_RANGING_RESPONSE: u8 = 0x05;
const MSG_STOP_RANGING: u8 = 0x06;
const MSG_STOP_RANGING_RESPONSE: u8 = 0x07;

#[derive(Debug, Clone, PartialEq)]
pub enum OobMessage {
    CapabilityRequest {
        requested: TechSet,
    },
    CapabilityResponse {
        supported: TechSet,
        /// Highest priority first.
        capabilities: Vec<TechCapability>,
    },
    SetConfiguration {
        start_immediately: TechSet,
        configs: Vec<TechConfig>,
    },
    SetConfigurationResponse {
        successful: TechSet,
    },
    StartRanging {
        techs: TechSet,
    },
    StartRangingResponse {
        successful: TechSet,
    },
    StopRanging {
        techs: TechSet,
    },
    StopRangingResponse {
        successful: TechSet,
    },
}

// ─── Reader / Writer helpers ─────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            Err(CodecError::Truncated {
                needed: n - self.remaining(),
                got: self.remaining(),
            })
        } else {
            let s = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(s)
        }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array6(&mut self) -> Result<[u8; 6], CodecError> {
        let b = self.take(6)?;
        Ok([b[0], b[1], b[2], b[3], b[4], b[5]])
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16_le(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u32_le(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }

    fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

fn device_role_to_u8(role: DeviceRole) -> u8 {
    match role {
        DeviceRole::Initiator => 1,
        DeviceRole::Responder => 2,
    }
}

fn device_role_from_u8(v: u8) -> DeviceRole {
    if v == 1 {
        DeviceRole::Initiator
    } else {
        DeviceRole::Responder
    }
}

fn device_mode_to_u8(mode: DeviceMode) -> u8 {
    match mode {
        DeviceMode::Controller => 1,
        DeviceMode::Controlee => 2,
    }
}

fn device_mode_from_u8(v: u8) -> DeviceMode {
    if v == 1 {
        DeviceMode::Controller
    } else {
        DeviceMode::Controlee
    }
}

// ─── TechConfig block payloads ───────────────────────────────────────────────

fn encode_config_payload(config: &TechConfig) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::default();
    match config {
        TechConfig::Uwb(c) => {
            if !matches!(c.session_key.len(), 8 | 16 | 32) {
                return Err(CodecError::UnexpectedKeyLength(c.session_key.len() as u8));
            }
            if !c.country_code.iter().all(|b| b.is_ascii_uppercase()) {
                return Err(CodecError::InvalidCountryCode);
            }
            w.u16_le(c.address);
            w.u32_le(c.session_id);
            w.u8(c.config_id);
            w.u8(c.channel);
            w.u8(c.preamble_index);
            w.u16_le(c.ranging_interval_ms);
            w.u8(c.slot_duration_ms);
            w.u8(c.session_key.len() as u8);
            w.bytes(&c.session_key);
            w.bytes(&c.country_code);
            w.u8(device_role_to_u8(c.device_role));
            w.u8(device_mode_to_u8(c.device_mode));
        }
        TechConfig::Cs(c) => {
            w.bytes(&c.bt_address);
            w.u8(c.security_level);
        }
        TechConfig::Rtt(c) => {
            let name_bytes = c.name.as_bytes();
            if name_bytes.len() > u8::MAX as usize {
                return Err(CodecError::NameTooLong(name_bytes.len()));
            }
            w.u8(name_bytes.len() as u8);
            w.bytes(name_bytes);
            w.u8(device_role_to_u8(c.device_role));
            w.u8(c.periodic_ranging as u8);
        }
        TechConfig::Rssi(c) => {
            w.bytes(&c.bt_address);
        }
    }
    Ok(w.into_vec())
}

fn decode_config_payload(
    tech: TechnologyTag,
    r: &mut Reader<'_>,
) -> Result<TechConfig, CodecError> {
    Ok(match tech {
        TechnologyTag::Uwb => {
            let address = r.u16_le()?;
            let session_id = r.u32_le()?;
            let config_id = r.u8()?;
            let channel = r.u8()?;
            let preamble_index = r.u8()?;
            let ranging_interval_ms = r.u16_le()?;
            let slot_duration_ms = r.u8()?;
            let key_len = r.u8()?;
            if !matches!(key_len, 8 | 16 | 32) {
                return Err(CodecError::UnexpectedKeyLength(key_len));
            }
            let session_key = r.take(key_len as usize)?.to_vec();
            let country = r.take(2)?;
            if !country.iter().all(|b| b.is_ascii_uppercase()) {
                return Err(CodecError::InvalidCountryCode);
            }
            let country_code = [country[0], country[1]];
            let device_role = device_role_from_u8(r.u8()?);
            let device_mode = device_mode_from_u8(r.u8()?);
            TechConfig::Uwb(UwbConfig {
                address,
                session_id,
                config_id,
                channel,
                preamble_index,
                ranging_interval_ms,
                slot_duration_ms,
                session_key,
                country_code,
                device_role,
                device_mode,
            })
        }
        TechnologyTag::Cs => {
            let bt_address = r.array6()?;
            let security_level = r.u8()?;
            TechConfig::Cs(CsConfig {
                bt_address,
                security_level,
            })
        }
        TechnologyTag::Rtt => {
            let name_len = r.u8()? as usize;
            let name_bytes = r.take(name_len)?;
            let name =
                String::from_utf8(name_bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
            let device_role = device_role_from_u8(r.u8()?);
            let periodic_ranging = r.u8()? != 0;
            TechConfig::Rtt(RttConfig {
                name,
                device_role,
                periodic_ranging,
            })
        }
        TechnologyTag::Rssi => {
            let bt_address = r.array6()?;
            TechConfig::Rssi(RssiConfig { bt_address })
        }
    })
}

// ─── TechCapability block payloads ───────────────────────────────────────────

fn encode_capability_payload(cap: &TechCapability) -> Vec<u8> {
    let mut w = Writer::default();
    match cap {
        TechCapability::Uwb(c) => {
            w.u16_le(c.address);
            w.u32_le(c.supported_channels);
            w.u32_le(c.supported_preambles);
            w.u32_le(c.supported_config_ids);
            w.u16_le(c.min_ranging_interval_ms);
            w.u8(c.min_slot_duration_ms);
            w.u8(c.supported_roles);
        }
        TechCapability::Cs(c) => {
            w.bytes(&c.bt_address);
            w.u8(c.supported_security_levels);
        }
        TechCapability::Rtt(c) => {
            w.u8(c.supports_periodic as u8);
            w.u8(c.supported_bandwidths);
        }
        TechCapability::Rssi(c) => {
            w.bytes(&c.bt_address);
        }
    }
    w.into_vec()
}

fn decode_capability_payload(
    tech: TechnologyTag,
    r: &mut Reader<'_>,
) -> Result<TechCapability, CodecError> {
    Ok(match tech {
        TechnologyTag::Uwb => {
            let address = r.u16_le()?;
            let supported_channels = r.u32_le()?;
            let supported_preambles = r.u32_le()?;
            let supported_config_ids = r.u32_le()?;
            let min_ranging_interval_ms = r.u16_le()?;
            let min_slot_duration_ms = r.u8()?;
            let supported_roles = r.u8()?;
            TechCapability::Uwb(UwbCapability {
                address,
                supported_channels,
                supported_preambles,
                supported_config_ids,
                min_ranging_interval_ms,
                min_slot_duration_ms,
                supported_roles,
            })
        }
        TechnologyTag::Cs => {
            let bt_address = r.array6()?;
            let supported_security_levels = r.u8()?;
            TechCapability::Cs(CsCapability {
                bt_address,
                supported_security_levels,
            })
        }
        TechnologyTag::Rtt => {
            let supports_periodic = r.u8()? != 0;
            let supported_bandwidths = r.u8()?;
            TechCapability::Rtt(RttCapability {
                supports_periodic,
                supported_bandwidths,
            })
        }
        TechnologyTag::Rssi => {
            let bt_address = r.array6()?;
            TechCapability::Rssi(RssiCapability { bt_address })
        }
    })
}

// ─── Generic block-list encode/decode ───────────────────────────────────────

fn write_block(w: &mut Writer, tech: TechnologyTag, payload: &[u8]) -> Result<(), CodecError> {
    let block_size = 2usize
        .checked_add(payload.len())
        .ok_or(CodecError::PayloadTooLarge(payload.len()))?;
    if block_size > u8::MAX as usize {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    w.u8(tech.bit_index());
    w.u8(block_size as u8);
    w.bytes(payload);
    Ok(())
}

/// Reads tech blocks until the reader is exhausted. Blocks with an
/// unrecognized `tech_id` are skipped (their bytes are still consumed so
/// parsing of the rest of the message stays aligned) rather than rejected.
fn read_config_blocks(r: &mut Reader<'_>) -> Result<Vec<TechConfig>, CodecError> {
    let mut out = Vec::new();
    while !r.is_empty() {
        let tech_id = r.u8()?;
        let block_size = r.u8()?;
        if block_size < 2 {
            return Err(CodecError::BlockSizeMismatch {
                declared: block_size,
                consumed: 0,
            });
        }
        let payload_len = (block_size - 2) as usize;
        let payload = r.take(payload_len)?;
        match TechnologyTag::from_bit_index(tech_id) {
            Some(tech) => {
                let mut sub = Reader::new(payload);
                let config = decode_config_payload(tech, &mut sub)?;
                if !sub.is_empty() {
                    return Err(CodecError::BlockSizeMismatch {
                        declared: block_size,
                        consumed: (payload_len - sub.remaining()) as u8,
                    });
                }
                out.push(config);
            }
            None => { /* unknown tech_id: bytes already consumed via `take`, skip */ }
        }
    }
    Ok(out)
}

fn read_capability_blocks(r: &mut Reader<'_>) -> Result<Vec<TechCapability>, CodecError> {
    let mut out = Vec::new();
    while !r.is_empty() {
        let tech_id = r.u8()?;
        let block_size = r.u8()?;
        if block_size < 2 {
            return Err(CodecError::BlockSizeMismatch {
                declared: block_size,
                consumed: 0,
            });
        }
        let payload_len = (block_size - 2) as usize;
        let payload = r.take(payload_len)?;
        match TechnologyTag::from_bit_index(tech_id) {
            Some(tech) => {
                let mut sub = Reader::new(payload);
                let cap = decode_capability_payload(tech, &mut sub)?;
                if !sub.is_empty() {
                    return Err(CodecError::BlockSizeMismatch {
                        declared: block_size,
                        consumed: (payload_len - sub.remaining()) as u8,
                    });
                }
                out.push(cap);
            }
            None => {}
        }
    }
    Ok(out)
}

// ─── Top-level encode / decode ───────────────────────────────────────────────

pub fn encode(msg: &OobMessage) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::default();
    w.u8(CURRENT_VERSION);
    match msg {
        OobMessage::CapabilityRequest { requested } => {
            w.u8(MSG_CAPABILITY_REQUEST);
            w.u16_le(requested.bits());
        }
        OobMessage::CapabilityResponse {
            supported,
            capabilities,
        } => {
            w.u8(MSG_CAPABILITY_RESPONSE);
            w.u16_le(supported.bits());
            let priority: TechSet = capabilities.iter().map(TechCapability::technology).collect();
            w.u16_le(priority.bits());
            for cap in capabilities {
                let payload = encode_capability_payload(cap);
                write_block(&mut w, cap.technology(), &payload)?;
            }
        }
        OobMessage::SetConfiguration {
            start_immediately,
            configs,
        } => {
            w.u8(MSG_SET_CONFIGURATION);
            let techs_set: TechSet = configs.iter().map(TechConfig::technology).collect();
            w.u16_le(techs_set.bits());
            w.u16_le(start_immediately.bits());
            for config in configs {
                let payload = encode_config_payload(config)?;
                write_block(&mut w, config.technology(), &payload)?;
            }
        }
        OobMessage::SetConfigurationResponse { successful } => {
            w.u8(MSG_SET_CONFIGURATION_RESPONSE);
            w.u16_le(successful.bits());
        }
        OobMessage::StartRanging { techs } => {
            w.u8(MSG_START_RANGING);
            w.u16_le(techs.bits());
        }
        OobMessage::StartRangingResponse { successful } => {
            w.u8(MSG_START_RANGING_RESPONSE);
            w.u16_le(successful.bits());
        }
        OobMessage::StopRanging { techs } => {
            w.u8(MSG_STOP_RANGING);
            w.u16_le(techs.bits());
        }
        OobMessage::StopRangingResponse { successful } => {
            w.u8(MSG_STOP_RANGING_RESPONSE);
            w.u16_le(successful.bits());
        }
    }
    Ok(w.into_vec())
}

pub fn decode(bytes: &[u8]) -> Result<OobMessage, CodecError> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if version != CURRENT_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let msg_type = r.u8()?;
    Ok(match msg_type {
        MSG_CAPABILITY_REQUEST => {
            let requested = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::CapabilityRequest { requested }
        }
        MSG_CAPABILITY_RESPONSE => {
            let supported = TechSet::from_bits(r.u16_le()?)?;
            let _priority = TechSet::from_bits(r.u16_le()?)?;
            let capabilities = read_capability_blocks(&mut r)?;
            OobMessage::CapabilityResponse {
                supported,
                capabilities,
            }
        }
        MSG_SET_CONFIGURATION => {
            let _techs_set = TechSet::from_bits(r.u16_le()?)?;
            let start_immediately = TechSet::from_bits(r.u16_le()?)?;
            let configs = read_config_blocks(&mut r)?;
            OobMessage::SetConfiguration {
                start_immediately,
                configs,
            }
        }
        MSG_SET_CONFIGURATION_RESPONSE => {
            let successful = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::SetConfigurationResponse { successful }
        }
        MSG_START_RANGING => {
            let techs = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::StartRanging { techs }
        }
        MSG_START_RANGING_RESPONSE => {
            let successful = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::StartRangingResponse { successful }
        }
        MSG_STOP_RANGING => {
            let techs = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::StopRanging { techs }
        }
        MSG_STOP_RANGING_RESPONSE => {
            let successful = TechSet::from_bits(r.u16_le()?)?;
            OobMessage::StopRangingResponse { successful }
        }
        other => return Err(CodecError::UnknownMessageType(other)),
    })
}
