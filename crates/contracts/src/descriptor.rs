//! StreamDescriptor - immutable description of a published stream

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::metadata::escape_xml;
use crate::{ChannelFormat, MetadataTree, Predicate, Result, StreamError, StreamUid};

/// Nominal rate sentinel for streams without a fixed sampling frequency
pub const IRREGULAR_RATE: f64 = 0.0;

/// Protocol revision spoken by this crate
pub const PROTOCOL_VERSION: u32 = 110;

/// Samples-per-second assumed when sizing buffers of irregular streams
pub const IRREGULAR_BUFFER_RATE: f64 = 100.0;

/// Stream description.
///
/// Identity is (name, content type, source id). Channel count and format are
/// fixed once an outlet has been created from the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    name: String,
    #[serde(rename = "type")]
    content_type: String,
    channel_count: u32,
    nominal_srate: f64,
    channel_format: ChannelFormat,
    #[serde(default)]
    source_id: String,

    // ===== Instance fields, filled in when published =====
    #[serde(default)]
    uid: StreamUid,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    created_at: f64,
    #[serde(default)]
    protocol_version: u32,
    #[serde(default)]
    v4address: Option<IpAddr>,
    #[serde(default)]
    data_port: u16,
    #[serde(default)]
    service_port: u16,

    #[serde(default)]
    desc: MetadataTree,
}

impl StreamDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    /// `Argument` for an empty name, zero channels or a negative / non-finite rate.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: u32,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(StreamError::argument("stream name must not be empty"));
        }
        if channel_count == 0 {
            return Err(StreamError::argument(format!(
                "stream '{name}' must have at least one channel"
            )));
        }
        if !nominal_srate.is_finite() || nominal_srate < 0.0 {
            return Err(StreamError::argument(format!(
                "stream '{name}' has invalid nominal rate {nominal_srate}"
            )));
        }
        Ok(Self {
            name,
            content_type: content_type.into(),
            channel_count,
            nominal_srate,
            channel_format,
            source_id: source_id.into(),
            uid: StreamUid::default(),
            session_id: "default".to_string(),
            hostname: String::new(),
            created_at: 0.0,
            protocol_version: PROTOCOL_VERSION,
            v4address: None,
            data_port: 0,
            service_port: 0,
            desc: MetadataTree::new(),
        })
    }

    // ========== Accessors ==========

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count as usize
    }

    pub fn nominal_srate(&self) -> f64 {
        self.nominal_srate
    }

    pub fn is_irregular(&self) -> bool {
        self.nominal_srate == IRREGULAR_RATE
    }

    pub fn channel_format(&self) -> ChannelFormat {
        self.channel_format
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn has_source_id(&self) -> bool {
        !self.source_id.is_empty()
    }

    pub fn uid(&self) -> &StreamUid {
        &self.uid
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn v4address(&self) -> Option<IpAddr> {
        self.v4address
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn service_port(&self) -> u16 {
        self.service_port
    }

    /// TCP endpoint sample data is served on
    pub fn data_endpoint(&self) -> Option<SocketAddr> {
        match (self.v4address, self.data_port) {
            (Some(ip), port) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// UDP endpoint answering queries and time probes
    pub fn service_endpoint(&self) -> Option<SocketAddr> {
        match (self.v4address, self.service_port) {
            (Some(ip), port) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    pub fn desc(&self) -> &MetadataTree {
        &self.desc
    }

    pub fn desc_mut(&mut self) -> &mut MetadataTree {
        &mut self.desc
    }

    /// Discovery cache key
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.content_type.clone())
    }

    /// Seconds between samples, `None` for irregular streams
    pub fn sample_interval(&self) -> Option<f64> {
        (!self.is_irregular()).then(|| 1.0 / self.nominal_srate)
    }

    /// Samples held by a buffer sized for `max_buffered_secs` of data
    pub fn buffer_capacity(&self, max_buffered_secs: f64) -> usize {
        let rate = if self.is_irregular() {
            IRREGULAR_BUFFER_RATE
        } else {
            self.nominal_srate
        };
        ((rate * max_buffered_secs).ceil() as usize).max(1)
    }

    /// Check a value array against the channel count
    pub fn check_channel_count(&self, len: usize) -> Result<()> {
        if len != self.channel_count() {
            return Err(StreamError::argument(format!(
                "stream '{}' has {} channels but {} values were given",
                self.name, self.channel_count, len
            )));
        }
        Ok(())
    }

    // ========== Instance fields ==========

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Stamp the fields an outlet assigns when it goes live
    pub fn publish_as(
        &mut self,
        uid: StreamUid,
        hostname: impl Into<String>,
        created_at: f64,
        data_port: u16,
        service_port: u16,
    ) {
        self.uid = uid;
        self.hostname = hostname.into();
        self.created_at = created_at;
        self.data_port = data_port;
        self.service_port = service_port;
    }

    /// Record the address the announcement came from
    pub fn set_v4address(&mut self, address: IpAddr) {
        self.v4address = Some(address);
    }

    /// Copy without the extended description, as carried by announcements
    pub fn without_desc(&self) -> Self {
        Self {
            desc: MetadataTree::new(),
            ..self.clone()
        }
    }

    // ========== Queries ==========

    /// Property value as seen by predicates
    pub fn property(&self, property: &str) -> Option<String> {
        Some(match property {
            "name" => self.name.clone(),
            "type" => self.content_type.clone(),
            "channel_count" => self.channel_count.to_string(),
            "nominal_srate" => self.nominal_srate.to_string(),
            "channel_format" => self.channel_format.as_str().to_string(),
            "source_id" => self.source_id.clone(),
            "hostname" => self.hostname.clone(),
            "uid" => self.uid.to_string(),
            "session_id" => self.session_id.clone(),
            _ => return None,
        })
    }

    pub fn matches_query(&self, predicate: &Predicate) -> bool {
        predicate.evaluate(|property| self.property(property))
    }

    /// Human-readable XML export (header fields plus `desc`)
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?>\n<info>\n");
        let mut field = |tag: &str, value: &str| {
            out.push_str(&format!("  <{tag}>{}</{tag}>\n", escape_xml(value)));
        };
        field("name", &self.name);
        field("type", &self.content_type);
        field("channel_count", &self.channel_count.to_string());
        field("nominal_srate", &self.nominal_srate.to_string());
        field("channel_format", self.channel_format.as_str());
        field("source_id", &self.source_id);
        field("version", &self.protocol_version.to_string());
        field("created_at", &self.created_at.to_string());
        field("uid", self.uid.as_str());
        field("session_id", &self.session_id);
        field("hostname", &self.hostname);
        field(
            "v4address",
            &self.v4address.map(|a| a.to_string()).unwrap_or_default(),
        );
        field("v4data_port", &self.data_port.to_string());
        field("v4service_port", &self.service_port.to_string());
        self.desc.write_xml(self.desc.root(), 1, &mut out);
        out.push_str("</info>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelSpec;

    fn markers() -> StreamDescriptor {
        StreamDescriptor::new("KartMarkers", "Markers", 1, IRREGULAR_RATE, ChannelFormat::Int32, "kart-01")
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_shape() {
        let empty = StreamDescriptor::new("", "EEG", 8, 250.0, ChannelFormat::Float32, "");
        assert!(matches!(empty, Err(StreamError::Argument { .. })));

        let no_channels = StreamDescriptor::new("EEG", "EEG", 0, 250.0, ChannelFormat::Float32, "");
        assert!(matches!(no_channels, Err(StreamError::Argument { .. })));

        let negative = StreamDescriptor::new("EEG", "EEG", 8, -1.0, ChannelFormat::Float32, "");
        assert!(matches!(negative, Err(StreamError::Argument { .. })));
    }

    #[test]
    fn test_buffer_capacity() {
        let eeg = StreamDescriptor::new("EEG", "EEG", 8, 250.0, ChannelFormat::Float32, "").unwrap();
        assert_eq!(eeg.buffer_capacity(2.0), 500);
        assert_eq!(markers().buffer_capacity(360.0), 36_000);
        assert_eq!(eeg.sample_interval(), Some(0.004));
        assert_eq!(markers().sample_interval(), None);
    }

    #[test]
    fn test_query_matching() {
        let desc = markers();
        assert!(desc.matches_query(&Predicate::parse("type='Markers' and channel_count=1").unwrap()));
        assert!(desc.matches_query(&Predicate::parse("channel_format='int32'").unwrap()));
        assert!(!desc.matches_query(&Predicate::parse("source_id='other'").unwrap()));
    }

    #[test]
    fn test_endpoints_need_address() {
        let mut desc = markers();
        desc.publish_as(StreamUid::generate(), "host", 1.0, 4000, 16572);
        assert!(desc.data_endpoint().is_none());
        desc.set_v4address("127.0.0.1".parse().unwrap());
        assert_eq!(desc.data_endpoint(), Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(desc.service_endpoint(), Some("127.0.0.1:16572".parse().unwrap()));
    }

    #[test]
    fn test_without_desc_and_xml() {
        let mut desc = markers();
        desc.desc_mut()
            .append_channels(&[ChannelSpec::new("code", "", "Marker")])
            .unwrap();
        assert!(desc.without_desc().desc().is_empty());

        let xml = desc.to_xml();
        assert!(xml.contains("<name>KartMarkers</name>"));
        assert!(xml.contains("<label>code</label>"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_desc() {
        let mut desc = markers();
        desc.desc_mut()
            .append_channels(&[ChannelSpec::new("code", "", "Marker")])
            .unwrap();
        let bytes = bincode::serialize(&desc).unwrap();
        let parsed: StreamDescriptor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(parsed, desc);
    }
}
