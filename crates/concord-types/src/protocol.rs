//! Binary sync message codec.
//!
//! Frames a payload as `tag ‖ varuint(len) ‖ payload` where `varuint` is
//! a LEB128-style 7-bit continuation unsigned integer. Two wire formats
//! share the codec: the plain format carries exactly one message per
//! frame, the multiplexed format prefixes every application frame with
//! an `ID` message carrying the room identifier so a single transport
//! can serve many rooms.

use crate::prelude::*;

/// The two-byte update meaning "no change". Never applied, never forwarded.
pub const EMPTY_UPDATE: &[u8] = &[0x00, 0x00];

/// Message type tags of the sync protocol.
///
/// `Read`, `ReadWrite` and the `Data*` tags are reserved: the codec
/// handles them but no component dispatches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
	SyncStep1,
	SyncStep2,
	SyncUpdate,
	SyncCross,
	Awareness,
	Id,
	Read,
	ReadWrite,
	DataRequest,
	DataOffer,
	DataOrder,
	DataTransfer,
}

impl MessageTag {
	/// The magic bytes identifying this message type on the wire.
	pub const fn bytes(self) -> &'static [u8] {
		match self {
			Self::SyncStep1 => &[0x00, 0x00],
			Self::SyncStep2 => &[0x00, 0x01],
			Self::SyncUpdate => &[0x00, 0x02],
			Self::SyncCross => &[0x00, 0x03],
			Self::Awareness => &[0x01],
			Self::Id => &[0x02, 0x00],
			Self::Read => &[0x02, 0x01],
			Self::ReadWrite => &[0x02, 0x02],
			Self::DataRequest => &[0x03, 0x00],
			Self::DataOffer => &[0x03, 0x01],
			Self::DataOrder => &[0x03, 0x02],
			Self::DataTransfer => &[0x03, 0x03],
		}
	}
}

/// Protocol flavour: one room per connection, or many rooms multiplexed
/// over a single connection via `ID` prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
	#[default]
	Plain,
	Multiplexed,
}

impl WireFormat {
	const fn accepts(self, tag: MessageTag) -> bool {
		match self {
			Self::Plain => matches!(
				tag,
				MessageTag::SyncStep1
					| MessageTag::SyncStep2
					| MessageTag::SyncUpdate
					| MessageTag::Awareness
			),
			Self::Multiplexed => true,
		}
	}
}

/// Number of bytes `write_var_uint` produces for `value`.
pub const fn varuint_len(value: usize) -> usize {
	let mut value = value;
	let mut len = 1;
	while value > 127 {
		value >>= 7;
		len += 1;
	}
	len
}

/// Append `value` as a 7-bit continuation varuint.
pub fn write_var_uint(buf: &mut Vec<u8>, mut value: usize) {
	while value > 127 {
		buf.push(0x80 | (value & 0x7f) as u8);
		value >>= 7;
	}
	buf.push(value as u8);
}

/// Read a varuint, returning `(value, bytes_consumed)`.
pub fn read_var_uint(data: &[u8]) -> CnResult<(usize, usize)> {
	let mut value = 0usize;
	let mut shift = 0u32;
	for (idx, byte) in data.iter().enumerate() {
		value |= usize::from(byte & 0x7f) << shift;
		if byte & 0x80 == 0 {
			return Ok((value, idx + 1));
		}
		shift += 7;
		if shift > usize::BITS {
			return Err(Error::MalformedFrame("varuint overflow".into()));
		}
	}
	Err(Error::MalformedFrame("truncated varuint".into()))
}

/// Encode `payload` as a frame of the given message type.
pub fn encode(tag: MessageTag, payload: &[u8]) -> Vec<u8> {
	let magic = tag.bytes();
	let mut frame = Vec::with_capacity(magic.len() + varuint_len(payload.len()) + payload.len());
	frame.extend_from_slice(magic);
	write_var_uint(&mut frame, payload.len());
	frame.extend_from_slice(payload);
	frame
}

/// Decode a frame of a known message type, returning `(payload, bytes_consumed)`.
///
/// Trailing bytes after the payload are accepted; a missing tag, a
/// truncated varuint or a declared length exceeding the available bytes
/// is a `MalformedFrame`.
pub fn decode(tag: MessageTag, frame: &[u8]) -> CnResult<(Vec<u8>, usize)> {
	let magic = tag.bytes();
	let Some(rest) = frame.strip_prefix(magic) else {
		return Err(Error::MalformedFrame(format!("missing {:?} tag", tag)));
	};
	let (len, header) = read_var_uint(rest)?;
	let end = header
		.checked_add(len)
		.ok_or_else(|| Error::MalformedFrame("payload length overflow".into()))?;
	if rest.len() < end {
		return Err(Error::MalformedFrame(format!(
			"payload truncated: declared {} bytes, got {}",
			len,
			rest.len().saturating_sub(header)
		)));
	}
	Ok((rest[header..end].to_vec(), magic.len() + end))
}

fn tag_of(format: WireFormat, frame: &[u8]) -> CnResult<MessageTag> {
	let first = *frame
		.first()
		.ok_or_else(|| Error::MalformedFrame("empty frame".into()))?;
	let tag = match first {
		0x01 => MessageTag::Awareness,
		0x00 | 0x02 | 0x03 => {
			let second = *frame
				.get(1)
				.ok_or_else(|| Error::MalformedFrame("truncated tag".into()))?;
			match (first, second) {
				(0x00, 0x00) => MessageTag::SyncStep1,
				(0x00, 0x01) => MessageTag::SyncStep2,
				(0x00, 0x02) => MessageTag::SyncUpdate,
				(0x00, 0x03) => MessageTag::SyncCross,
				(0x02, 0x00) => MessageTag::Id,
				(0x02, 0x01) => MessageTag::Read,
				(0x02, 0x02) => MessageTag::ReadWrite,
				(0x03, 0x00) => MessageTag::DataRequest,
				(0x03, 0x01) => MessageTag::DataOffer,
				(0x03, 0x02) => MessageTag::DataOrder,
				(0x03, 0x03) => MessageTag::DataTransfer,
				_ => return Err(Error::UnknownMessage(first)),
			}
		}
		other => return Err(Error::UnknownMessage(other)),
	};
	if format.accepts(tag) {
		Ok(tag)
	} else {
		Err(Error::UnknownMessage(first))
	}
}

/// Infer the message type from the leading tag bytes and decode the frame.
pub fn infer_and_decode(format: WireFormat, frame: &[u8]) -> CnResult<(MessageTag, Vec<u8>, usize)> {
	let tag = tag_of(format, frame)?;
	let (payload, consumed) = decode(tag, frame)?;
	Ok((tag, payload, consumed))
}

/// Build the payload of a `SYNC_CROSS` message: two varuint-prefixed blobs.
pub fn encode_cross(update: &[u8], state: &[u8]) -> Vec<u8> {
	let mut payload =
		Vec::with_capacity(varuint_len(update.len()) + update.len() + varuint_len(state.len()) + state.len());
	write_var_uint(&mut payload, update.len());
	payload.extend_from_slice(update);
	write_var_uint(&mut payload, state.len());
	payload.extend_from_slice(state);
	payload
}

/// Split a `SYNC_CROSS` payload into `(update, state)`.
pub fn decode_cross(payload: &[u8]) -> CnResult<(Vec<u8>, Vec<u8>)> {
	let (update_len, header) = read_var_uint(payload)?;
	let update_end = header
		.checked_add(update_len)
		.filter(|end| *end <= payload.len())
		.ok_or_else(|| Error::MalformedFrame("cross sync update truncated".into()))?;
	let update = payload[header..update_end].to_vec();

	let rest = &payload[update_end..];
	let (state_len, header) = read_var_uint(rest)?;
	let state_end = header
		.checked_add(state_len)
		.filter(|end| *end <= rest.len())
		.ok_or_else(|| Error::MalformedFrame("cross sync state truncated".into()))?;
	let state = rest[header..state_end].to_vec();

	Ok((update, state))
}

/// Prefix `inner` with an `ID` message carrying `identifier` (multiplexed format).
pub fn encode_with_id(identifier: &str, inner: &[u8]) -> Vec<u8> {
	let mut frame = encode(MessageTag::Id, identifier.as_bytes());
	frame.extend_from_slice(inner);
	frame
}

/// Strip the leading `ID` message off a multiplexed frame, returning the
/// identifier and the remaining inner message.
pub fn split_id(frame: &[u8]) -> CnResult<(String, &[u8])> {
	let (payload, consumed) = decode(MessageTag::Id, frame)?;
	let identifier = String::from_utf8(payload)
		.map_err(|_| Error::MalformedFrame("identifier is not valid UTF-8".into()))?;
	Ok((identifier, &frame[consumed..]))
}


// vim: ts=4
