pub mod clock;
pub mod sink;

use proctrace_common::{direction, PacketEvent};
use std::fmt;

pub use clock::TraceClock;
pub use sink::{MetricSink, SinkMode};

/// Traffic direction of a recorded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    /// Label for this direction's filter in logs and errors. The filter
    /// aya installs in the kernel carries [`Self::program_name`] instead.
    pub const fn link_label(&self) -> &'static str {
        match self {
            Direction::Ingress => "report-ingress",
            Direction::Egress => "report-egress",
        }
    }

    /// Name of the classifier entry point in the probe object.
    pub const fn program_name(&self) -> &'static str {
        match self {
            Direction::Ingress => "report_ingress",
            Direction::Egress => "report_egress",
        }
    }

    pub const fn as_raw(&self) -> u64 {
        match self {
            Direction::Ingress => direction::INGRESS,
            Direction::Egress => direction::EGRESS,
        }
    }

    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            direction::INGRESS => Some(Direction::Ingress),
            direction::EGRESS => Some(Direction::Egress),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a trace record, decided when the record is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Scalar(u64),
    NetworkEvent {
        length: u64,
        src_addr: u64,
        dst_addr: u64,
        src_port: u64,
        dst_port: u64,
        direction: Direction,
    },
}

/// One timestamped observation. Timestamps are nanoseconds in the
/// monotonic clock domain, see [`TraceClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub timestamp: u64,
    pub value: Sample,
}

impl TraceRecord {
    pub fn scalar(timestamp: u64, value: u64) -> Self {
        Self {
            timestamp,
            value: Sample::Scalar(value),
        }
    }

    /// Build a network record from a drained map entry. The map key is the
    /// kernel timestamp of the packet.
    ///
    /// Returns `None` if the event carries an unknown direction.
    pub fn from_packet(timestamp: u64, event: &PacketEvent) -> Option<Self> {
        let direction = Direction::from_raw(event.direction)?;
        Some(Self {
            timestamp,
            value: Sample::NetworkEvent {
                length: event.len,
                src_addr: event.saddr,
                dst_addr: event.daddr,
                src_port: event.sport,
                dst_port: event.dport,
                direction,
            },
        })
    }
}

/// Sink line format: `timestamp,value` or
/// `timestamp,length,src_addr,dst_addr,src_port,dst_port,direction`.
impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Sample::Scalar(value) => write!(f, "{},{}", self.timestamp, value),
            Sample::NetworkEvent {
                length,
                src_addr,
                dst_addr,
                src_port,
                dst_port,
                direction,
            } => write!(
                f,
                "{},{},{},{},{},{},{}",
                self.timestamp,
                length,
                src_addr,
                dst_addr,
                src_port,
                dst_port,
                direction.as_raw()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_line_format() {
        let record = TraceRecord::scalar(1_000, 150);
        assert_eq!(record.to_string(), "1000,150");
    }

    #[test]
    fn test_network_line_format() {
        let event = PacketEvent {
            len: 74,
            saddr: 0x0100007F,
            daddr: 0x0100007F,
            sport: 443,
            dport: 51000,
            direction: direction::EGRESS,
        };
        let record = TraceRecord::from_packet(42, &event).unwrap();
        assert_eq!(record.to_string(), "42,74,16777343,16777343,443,51000,1");
    }

    #[test]
    fn test_unknown_direction_is_rejected() {
        let event = PacketEvent {
            direction: 7,
            ..Default::default()
        };
        assert!(TraceRecord::from_packet(1, &event).is_none());
    }

    #[test]
    fn test_link_labels_are_deterministic() {
        assert_eq!(Direction::Ingress.link_label(), "report-ingress");
        assert_eq!(Direction::Egress.link_label(), "report-egress");
        for direction in Direction::ALL {
            assert_ne!(direction.link_label(), direction.program_name());
        }
        assert_eq!(Direction::from_raw(Direction::Egress.as_raw()), Some(Direction::Egress));
    }
}
