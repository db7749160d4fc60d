//! MQTT 3.1.1 (v4) control packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ConnectFlags, ConnectReturnCode, PacketType, QoS};

use super::codec::{
    read_binary, read_fixed_header, read_string, read_u8, read_u16, variable_int_len,
    write_binary, write_fixed_header, write_string, write_u16,
};

/// MQTT 3.1.1 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// 4 for MQTT 3.1.1, 3 for the legacy `MQIsdp` name.
    pub protocol_level: u8,
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            protocol_level: 4,
            client_id: client_id.into(),
            keep_alive: 0,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Zero when `qos` is [`QoS::AtMostOnce`].
    pub pkid: u16,
}

impl Publish {
    pub fn new(topic: impl Into<String>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            pkid: 0,
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    /// Requested QoS byte as sent; out-of-range values are refused per filter
    /// by the topic engine rather than failing the whole packet.
    pub qos: u8,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self { path: path.into(), qos: qos as u8 }
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// Per-filter SUBACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(SubscribeReturnCode::Failure),
            other => QoS::from_u8(other)
                .map(SubscribeReturnCode::Success)
                .map_err(|_| Error::MalformedPacket(format!("suback return code {other:#04x}"))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

// ============================================================================
// Packet parsing
// ============================================================================

impl Packet {
    /// Parse one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied, or
    /// [`Error::Incomplete`] when `buf` does not yet hold the whole packet.
    /// A remaining length above `max_size` fails with
    /// [`Error::PayloadTooLarge`] before the body is looked at.
    pub fn read(buf: &[u8], max_size: usize) -> Result<(Packet, usize)> {
        let header = read_fixed_header(buf)?;
        let remaining = header.remaining_length as usize;

        if remaining > max_size {
            return Err(Error::PayloadTooLarge { size: remaining, max: max_size });
        }

        let total_len = header.header_length + remaining;
        if buf.len() < total_len {
            return Err(Error::Incomplete { needed: total_len - buf.len() });
        }

        let body = &buf[header.header_length..total_len];
        let packet_type = header.packet_type;

        match packet_type {
            PacketType::Publish => {}
            PacketType::Subscribe | PacketType::Unsubscribe | PacketType::PubRel => {
                expect_flags(packet_type, header.flags, 0x02)?
            }
            _ => expect_flags(packet_type, header.flags, 0x00)?,
        }

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(body)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(body)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, body)?),
            PacketType::PubAck => Packet::PubAck(read_pkid_body(body)?),
            PacketType::PubRec => Packet::PubRec(read_pkid_body(body)?),
            PacketType::PubRel => Packet::PubRel(read_pkid_body(body)?),
            PacketType::PubComp => Packet::PubComp(read_pkid_body(body)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(body)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(body)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(body)?),
            PacketType::UnsubAck => Packet::UnsubAck(read_pkid_body(body)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        if matches!(packet, Packet::PingReq | Packet::PingResp | Packet::Disconnect) && !body.is_empty() {
            return Err(Error::MalformedPacket(format!(
                "{packet_type:?} with {} byte body",
                body.len()
            )));
        }

        Ok((packet, total_len))
    }

    /// Encode the packet, returning the number of bytes appended to `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        buf.reserve(self.size());
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(pkid) => write_pkid_packet(buf, PacketType::PubAck, 0x00, *pkid),
            Packet::PubRec(pkid) => write_pkid_packet(buf, PacketType::PubRec, 0x00, *pkid),
            Packet::PubRel(pkid) => write_pkid_packet(buf, PacketType::PubRel, 0x02, *pkid),
            Packet::PubComp(pkid) => write_pkid_packet(buf, PacketType::PubComp, 0x00, *pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(pkid) => write_pkid_packet(buf, PacketType::UnsubAck, 0x00, *pkid),
            Packet::PingReq => write_fixed_header(buf, PacketType::PingReq, 0, 0),
            Packet::PingResp => write_fixed_header(buf, PacketType::PingResp, 0, 0),
            Packet::Disconnect => write_fixed_header(buf, PacketType::Disconnect, 0, 0),
        }
    }

    /// Calculate packet size.
    pub fn size(&self) -> usize {
        let remaining = match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.remaining_length(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(p) => p.remaining_length(),
            Packet::SubAck(p) => p.remaining_length(),
            Packet::Unsubscribe(p) => p.remaining_length(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        1 + variable_int_len(remaining as u32) + remaining
    }

    /// Control packet type of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

fn expect_flags(packet_type: PacketType, flags: u8, expected: u8) -> Result<()> {
    if flags != expected {
        return Err(Error::MalformedPacket(format!(
            "{packet_type:?} header flags {flags:#06b}, expected {expected:#06b}"
        )));
    }
    Ok(())
}

fn read_pkid_body(body: &[u8]) -> Result<u16> {
    if body.len() != 2 {
        return Err(Error::MalformedPacket(format!(
            "packet identifier body of {} bytes",
            body.len()
        )));
    }
    read_u16(body)
}

fn write_pkid_packet(buf: &mut BytesMut, packet_type: PacketType, flags: u8, pkid: u16) -> Result<usize> {
    let header_len = write_fixed_header(buf, packet_type, flags, 2)?;
    write_u16(buf, pkid);
    Ok(header_len + 2)
}

fn ensure_consumed(packet_type: PacketType, body: &[u8], pos: usize) -> Result<()> {
    if pos != body.len() {
        return Err(Error::MalformedPacket(format!(
            "{packet_type:?} has {} trailing bytes",
            body.len() - pos
        )));
    }
    Ok(())
}

// ============================================================================
// Individual packet implementations
// ============================================================================

impl Connect {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut pos = 0;

        // Protocol name
        let (name, len) = read_string(buf)?;
        pos += len;

        // Protocol level. The name must agree with the level family; an
        // unknown level is left for the connection to refuse with a CONNACK.
        let protocol_level = read_u8(&buf[pos..])?;
        pos += 1;
        match (name.as_str(), protocol_level) {
            ("MQIsdp", 3) => {}
            ("MQTT", level) if level != 3 => {}
            _ => {
                return Err(Error::MalformedPacket(format!(
                    "protocol name {name:?} with level {protocol_level}"
                )));
            }
        }

        // Connect flags
        let flags = ConnectFlags::decode(read_u8(&buf[pos..])?)?;
        pos += 1;

        // Keep alive
        let keep_alive = read_u16(&buf[pos..])?;
        pos += 2;

        // Client ID
        let (client_id, len) = read_string(&buf[pos..])?;
        pos += len;

        // Will
        let will = if flags.will {
            let (topic, len) = read_string(&buf[pos..])?;
            pos += len;
            let (payload, len) = read_binary(&buf[pos..])?;
            pos += len;
            Some(Will {
                topic,
                payload,
                qos: flags.will_qos,
                retain: flags.will_retain,
            })
        } else {
            None
        };

        // Username
        let username = if flags.username {
            let (u, len) = read_string(&buf[pos..])?;
            pos += len;
            Some(u)
        } else {
            None
        };

        // Password
        let password = if flags.password {
            let (p, len) = read_binary(&buf[pos..])?;
            pos += len;
            Some(p)
        } else {
            None
        };

        ensure_consumed(PacketType::Connect, buf, pos)?;

        Ok(Connect {
            protocol_level,
            client_id,
            keep_alive,
            clean_session: flags.clean_session,
            username,
            password,
            will,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let remaining_len = self.remaining_length();
        let mut pos = write_fixed_header(buf, PacketType::Connect, 0, remaining_len)?;

        // Protocol name and level
        pos += write_string(buf, self.protocol_name())?;
        buf.put_u8(self.protocol_level);
        pos += 1;

        // Connect flags
        let mut flags = ConnectFlags {
            clean_session: self.clean_session,
            username: self.username.is_some(),
            password: self.password.is_some(),
            ..Default::default()
        };
        if let Some(ref will) = self.will {
            flags.will = true;
            flags.will_qos = will.qos;
            flags.will_retain = will.retain;
        }
        buf.put_u8(flags.encode());
        pos += 1;

        // Keep alive
        write_u16(buf, self.keep_alive);
        pos += 2;

        // Client ID
        pos += write_string(buf, &self.client_id)?;

        // Will
        if let Some(ref will) = self.will {
            pos += write_string(buf, &will.topic)?;
            pos += write_binary(buf, &will.payload)?;
        }

        // Username
        if let Some(ref username) = self.username {
            pos += write_string(buf, username)?;
        }

        // Password
        if let Some(ref password) = self.password {
            pos += write_binary(buf, password)?;
        }

        Ok(pos)
    }

    fn protocol_name(&self) -> &'static str {
        if self.protocol_level == 3 { "MQIsdp" } else { "MQTT" }
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep_alive
        let mut len = 2 + self.protocol_name().len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }
}

impl ConnAck {
    pub fn new(code: ConnectReturnCode, session_present: bool) -> Self {
        Self { session_present, code }
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() != 2 {
            return Err(Error::MalformedPacket(format!("CONNACK body of {} bytes", buf.len())));
        }
        if buf[0] & 0xFE != 0 {
            return Err(Error::MalformedPacket("reserved CONNACK flags set".into()));
        }

        let session_present = buf[0] & 0x01 != 0;
        let code = ConnectReturnCode::from_u8(buf[1])
            .ok_or_else(|| Error::MalformedPacket(format!("CONNACK return code {}", buf[1])))?;

        Ok(ConnAck { session_present, code })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let header_len = write_fixed_header(buf, PacketType::ConnAck, 0, 2)?;
        buf.put_u8(u8::from(self.session_present));
        buf.put_u8(self.code as u8);
        Ok(header_len + 2)
    }
}

impl Publish {
    pub fn read(flags: u8, buf: &[u8]) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos = QoS::from_u8((flags >> 1) & 0x03)?;
        let retain = flags & 0x01 != 0;

        let (topic, mut pos) = read_string(buf)?;

        let pkid = if qos == QoS::AtMostOnce {
            0
        } else {
            let pkid = read_u16(&buf[pos..])?;
            if pkid == 0 {
                return Err(Error::MalformedPacket("PUBLISH with packet identifier 0".into()));
            }
            pos += 2;
            pkid
        };

        Ok(Publish {
            topic,
            payload: Bytes::copy_from_slice(&buf[pos..]),
            qos,
            retain,
            dup,
            pkid,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        let mut pos = write_fixed_header(buf, PacketType::Publish, flags, self.remaining_length())?;
        pos += write_string(buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            write_u16(buf, self.pkid);
            pos += 2;
        }
        buf.put_slice(&self.payload);
        pos += self.payload.len();

        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        let pkid_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        2 + self.topic.len() + pkid_len + self.payload.len()
    }
}

impl Subscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf)?;
        let mut pos = 2;
        let mut filters = Vec::new();

        while pos < buf.len() {
            let (path, len) = read_string(&buf[pos..])?;
            pos += len;
            let qos = read_u8(&buf[pos..])?;
            pos += 1;
            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(Error::MalformedPacket("SUBSCRIBE without filters".into()));
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::Subscribe, 0x02, self.remaining_length())?;
        write_u16(buf, self.pkid);
        pos += 2;
        for filter in &self.filters {
            pos += write_string(buf, &filter.path)?;
            buf.put_u8(filter.qos);
            pos += 1;
        }
        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.filters.iter().map(|f| 2 + f.path.len() + 1).sum::<usize>()
    }
}

impl SubAck {
    pub fn new(pkid: u16, return_codes: Vec<SubscribeReturnCode>) -> Self {
        Self { pkid, return_codes }
    }

    /// Zero return codes are accepted so the SUBACK-shaped unsubscribe reply
    /// can be read back.
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf)?;
        let return_codes = buf[2..]
            .iter()
            .map(|&code| SubscribeReturnCode::from_u8(code))
            .collect::<Result<Vec<_>>>()?;
        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::SubAck, 0, self.remaining_length())?;
        write_u16(buf, self.pkid);
        pos += 2;
        for code in &self.return_codes {
            buf.put_u8(code.to_u8());
        }
        pos += self.return_codes.len();
        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.return_codes.len()
    }
}

impl Unsubscribe {
    pub fn read(buf: &[u8]) -> Result<Self> {
        let pkid = read_u16(buf)?;
        let mut pos = 2;
        let mut topics = Vec::new();

        while pos < buf.len() {
            let (topic, len) = read_string(&buf[pos..])?;
            pos += len;
            topics.push(topic);
        }

        if topics.is_empty() {
            return Err(Error::MalformedPacket("UNSUBSCRIBE without filters".into()));
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<usize> {
        let mut pos = write_fixed_header(buf, PacketType::Unsubscribe, 0x02, self.remaining_length())?;
        write_u16(buf, self.pkid);
        pos += 2;
        for topic in &self.topics {
            pos += write_string(buf, topic)?;
        }
        Ok(pos)
    }

    fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }
}
