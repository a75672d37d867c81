//! Prometheus text exposition of replication monitors.
//!
//! Every sample is scoped to a replica: the base DN, the server reporting it,
//! and for replication servers the connected domain the sample is about.

use std::fmt::{self, Write as _};

use crate::csn::ServerId;
use crate::dn::Dn;
use crate::status::ReplicaStatus;

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic total.
    Counter,
    /// Current level.
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        })
    }
}

/// Labels identifying the replica a sample describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaLabels {
    base_dn: Dn,
    server_id: ServerId,
    peer: Option<ServerId>,
    status: Option<ReplicaStatus>,
}

impl ReplicaLabels {
    /// Sample reported by `server_id` about `base_dn`.
    pub fn new(base_dn: &Dn, server_id: ServerId) -> Self {
        Self {
            base_dn: base_dn.clone(),
            server_id,
            peer: None,
            status: None,
        }
    }

    /// Narrows the sample to one connected domain.
    pub fn peer(mut self, peer: ServerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Adds the status label (status gauges).
    pub fn status(mut self, status: ReplicaStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn render(&self, out: &mut String) {
        let _ = write!(
            out,
            "base_dn=\"{}\",server_id=\"{}\"",
            escape_label(&self.base_dn.to_string()),
            self.server_id
        );
        if let Some(peer) = self.peer {
            let _ = write!(out, ",peer=\"{peer}\"");
        }
        if let Some(status) = self.status {
            let _ = write!(out, ",status=\"{status}\"");
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

struct Family {
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
    samples: Vec<(ReplicaLabels, u64)>,
}

/// Samples grouped by metric name, in first-seen order.
#[derive(Default)]
pub struct Exposition {
    families: Vec<Family>,
}

impl Exposition {
    /// Empty exposition.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &mut self,
        kind: MetricKind,
        name: &'static str,
        help: &'static str,
        labels: ReplicaLabels,
        value: u64,
    ) {
        match self.families.iter_mut().find(|f| f.name == name) {
            Some(family) => family.samples.push((labels, value)),
            None => self.families.push(Family {
                name,
                help,
                kind,
                samples: vec![(labels, value)],
            }),
        }
    }

    /// Adds a counter sample.
    pub fn counter(&mut self, name: &'static str, help: &'static str, labels: ReplicaLabels, value: u64) {
        self.record(MetricKind::Counter, name, help, labels, value);
    }

    /// Adds a gauge sample.
    pub fn gauge(&mut self, name: &'static str, help: &'static str, labels: ReplicaLabels, value: u64) {
        self.record(MetricKind::Gauge, name, help, labels, value);
    }

    /// Number of distinct metric names.
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Text exposition, HELP and TYPE once per metric name.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for family in &self.families {
            let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
            let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind);
            for (labels, value) in &family.samples {
                out.push_str(family.name);
                out.push('{');
                labels.render(&mut out);
                let _ = writeln!(out, "}} {value}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(base: &str) -> ReplicaLabels {
        ReplicaLabels::new(&Dn::new(base), ServerId::new(1))
    }

    #[test]
    fn test_counter_rendering() {
        let mut exposition = Exposition::new();
        exposition.counter("c_total", "A counter", labels("dc=example"), 42);
        assert_eq!(
            exposition.render(),
            "# HELP c_total A counter\n# TYPE c_total counter\nc_total{base_dn=\"dc=example\",server_id=\"1\"} 42\n"
        );
    }

    #[test]
    fn test_peer_and_status_labels() {
        let mut exposition = Exposition::new();
        exposition.gauge(
            "g",
            "help",
            labels("dc=example").peer(ServerId::new(7)).status(ReplicaStatus::Degraded),
            1,
        );
        assert!(exposition
            .render()
            .contains("g{base_dn=\"dc=example\",server_id=\"1\",peer=\"7\",status=\"degraded\"} 1\n"));
    }

    #[test]
    fn test_label_values_escaped() {
        let mut exposition = Exposition::new();
        exposition.gauge("g", "help", labels("cn=a\"b"), 1);
        assert!(exposition.render().contains("base_dn=\"cn=a\\\"b\""));
    }

    #[test]
    fn test_headers_once_per_name() {
        let mut exposition = Exposition::new();
        exposition.gauge("g", "help", labels("dc=a"), 1);
        exposition.counter("c", "help", labels("dc=a"), 2);
        exposition.gauge("g", "help", labels("dc=b"), 3);
        assert_eq!(exposition.len(), 2);
        let text = exposition.render();
        assert_eq!(text.matches("# TYPE g gauge").count(), 1);
        assert!(text.contains("g{base_dn=\"dc=b\",server_id=\"1\"} 3\n"));
        assert!(text.find("# TYPE g").unwrap() < text.find("# TYPE c").unwrap());
    }
}
