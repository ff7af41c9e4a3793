use super::state::SessionAddrs;
use crate::config::{IngestConfig, PackagingConfig};
use crate::db::models::stream_models::StreamRecord;
use crate::error::Error;
use std::net::{IpAddr, SocketAddr};

/// Where a session's listeners go
pub trait AddressPlan: Send + Sync {
    fn addresses(&self, record: &StreamRecord) -> Result<SessionAddrs, Error>;
}

/// Every session gets its own ingest and packaging port, offset from the
/// configured base ports by the stream id. Ports are stable across restarts.
#[derive(Debug, Clone)]
pub struct PortPolicy {
    ingest_ip: IpAddr,
    ingest_base: u16,
    packaging_ip: IpAddr,
    packaging_base: u16,
}

impl PortPolicy {
    pub fn new(ingest: &IngestConfig, packaging: &PackagingConfig) -> Result<Self, Error> {
        let parse = |address: &str| {
            address
                .parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("Invalid listen address {:?}: {}", address, e)))
        };

        Ok(Self {
            ingest_ip: parse(&ingest.address)?,
            ingest_base: ingest.base_port,
            packaging_ip: parse(&packaging.address)?,
            packaging_base: packaging.base_port,
        })
    }

    pub fn ingest_port(&self, record: &StreamRecord) -> Result<u16, Error> {
        offset_port(self.ingest_base, record)
    }

    pub fn packaging_port(&self, record: &StreamRecord) -> Result<u16, Error> {
        offset_port(self.packaging_base, record)
    }
}

fn offset_port(base: u16, record: &StreamRecord) -> Result<u16, Error> {
    let port = base as i64 + record.port_offset();
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0 || base == 0)
        .ok_or_else(|| {
            Error::Bind(format!(
                "Stream {} maps to port {} which is out of range",
                record.id, port
            ))
        })
}

impl AddressPlan for PortPolicy {
    fn addresses(&self, record: &StreamRecord) -> Result<SessionAddrs, Error> {
        Ok(SessionAddrs {
            ingest: SocketAddr::new(self.ingest_ip, self.ingest_port(record)?),
            packaging: SocketAddr::new(self.packaging_ip, self.packaging_port(record)?),
        })
    }
}

/// Public URLs of a stream, derived from configuration and never persisted
#[derive(Debug, Clone)]
pub struct StreamUrls {
    policy: PortPolicy,
    public_host: String,
    app_name: String,
}

impl StreamUrls {
    pub fn new(ingest: &IngestConfig, packaging: &PackagingConfig) -> Result<Self, Error> {
        Ok(Self {
            policy: PortPolicy::new(ingest, packaging)?,
            public_host: ingest.public_host.clone(),
            app_name: ingest.app_name.clone(),
        })
    }

    /// Where the publisher points its encoder; the stream key goes in the
    /// encoder's stream name field
    pub fn ingest_url(&self, record: &StreamRecord) -> Result<String, Error> {
        Ok(format!(
            "rtmp://{}:{}/{}",
            self.public_host,
            self.policy.ingest_port(record)?,
            self.app_name
        ))
    }

    pub fn play_url(&self, record: &StreamRecord) -> Result<String, Error> {
        Ok(format!(
            "http://{}:{}/live/{}.flv",
            self.public_host,
            self.policy.packaging_port(record)?,
            record.routing_hash
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn urls_use_session_ports_and_hash() {
        let urls = StreamUrls::new(&IngestConfig::default(), &PackagingConfig::default()).unwrap();
        let record = record(2);

        assert_eq!(urls.ingest_url(&record).unwrap(), "rtmp://localhost:1936/live");
        assert_eq!(
            urls.play_url(&record).unwrap(),
            "http://localhost:7002/live/00000002.flv"
        );
    }

    fn record(id: i64) -> StreamRecord {
        StreamRecord {
            id,
            stream_key: format!("key-{}", id),
            routing_hash: format!("{:08x}", id),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ports_are_offset_by_stream_id() {
        let policy = PortPolicy::new(&IngestConfig::default(), &PackagingConfig::default()).unwrap();

        let first = policy.addresses(&record(1)).unwrap();
        assert_eq!(first.ingest.port(), 1935);
        assert_eq!(first.packaging.port(), 7001);

        let third = policy.addresses(&record(3)).unwrap();
        assert_eq!(third.ingest.port(), 1937);
        assert_eq!(third.packaging.port(), 7003);
    }

    #[test]
    fn out_of_range_port_is_a_bind_error() {
        let policy = PortPolicy::new(&IngestConfig::default(), &PackagingConfig::default()).unwrap();
        let err = policy.addresses(&record(70_000)).unwrap_err();
        assert!(matches!(err, Error::Bind(_)));
    }

    #[test]
    fn bad_address_is_a_config_error() {
        let ingest = IngestConfig {
            address: "not-an-ip".to_string(),
            ..IngestConfig::default()
        };
        assert!(matches!(
            PortPolicy::new(&ingest, &PackagingConfig::default()),
            Err(Error::Config(_))
        ));
    }
}
