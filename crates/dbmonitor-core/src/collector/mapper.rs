//! Session record → gauge mapping.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use prometheus::core::{Collector as _, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};

use super::sampler::SessionRecord;

/// Label names, in exposition order.
pub const LABEL_NAMES: [&str; 7] = ["dbinstance", "id", "user", "host", "db", "command", "state"];

const HELP: &str = "count sleep connections";

/// Which sessions are exported, and under which metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricVariant {
    /// `mysqlconn`: every session.
    #[default]
    Sessions,
    /// `mysqlsleepconn`: only sessions whose command is `Sleep`.
    Sleep,
}

impl MetricVariant {
    pub fn metric_name(self) -> &'static str {
        match self {
            MetricVariant::Sessions => "mysqlconn",
            MetricVariant::Sleep => "mysqlsleepconn",
        }
    }

    fn accepts(self, record: &SessionRecord) -> bool {
        match self {
            MetricVariant::Sessions => true,
            MetricVariant::Sleep => record.command.eq_ignore_ascii_case("sleep"),
        }
    }
}

impl FromStr for MetricVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sessions" | "mysqlconn" => Ok(MetricVariant::Sessions),
            "sleep" | "mysqlsleepconn" => Ok(MetricVariant::Sleep),
            other => Err(format!(
                "unknown metric variant '{}', expected 'sessions' or 'sleep'",
                other
            )),
        }
    }
}

impl fmt::Display for MetricVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metric_name())
    }
}

/// One gauge sample: seven label values and the session's elapsed seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEmission {
    pub instance: String,
    pub id: String,
    pub user: String,
    pub host: String,
    pub database: String,
    pub command: String,
    pub state: String,
    pub value: f64,
}

impl MetricEmission {
    /// Label values in [`LABEL_NAMES`] order.
    pub fn label_values(&self) -> [&str; 7] {
        [
            &self.instance,
            &self.id,
            &self.user,
            &self.host,
            &self.database,
            &self.command,
            &self.state,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricMapper {
    variant: MetricVariant,
}

impl MetricMapper {
    pub fn new(variant: MetricVariant) -> Self {
        Self { variant }
    }

    pub fn metric_name(&self) -> &'static str {
        self.variant.metric_name()
    }

    /// Static descriptor of the exported gauge.
    pub fn desc(&self) -> prometheus::Result<Desc> {
        Desc::new(
            self.metric_name().to_string(),
            HELP.to_string(),
            LABEL_NAMES.iter().map(|l| l.to_string()).collect(),
            HashMap::new(),
        )
    }

    /// Maps one record; `None` when the variant filters it out.
    pub fn map(&self, instance: &str, record: &SessionRecord) -> Option<MetricEmission> {
        if !self.variant.accepts(record) {
            return None;
        }
        Some(MetricEmission {
            instance: instance.to_string(),
            id: record.id.clone(),
            user: record.user.clone(),
            host: record.host_without_port().to_string(),
            database: record.database.clone(),
            command: record.command.clone(),
            state: record.state.clone(),
            value: record.elapsed_seconds as f64,
        })
    }

    /// Builds metric families from one scrape's emissions.
    ///
    /// A fresh vector is used each time, so sessions that ended since the
    /// previous scrape are not reported. No emissions yields no families.
    pub fn encode(&self, emissions: &[MetricEmission]) -> prometheus::Result<Vec<MetricFamily>> {
        if emissions.is_empty() {
            return Ok(Vec::new());
        }

        let gauge = GaugeVec::new(Opts::new(self.metric_name(), HELP), &LABEL_NAMES)?;
        for emission in emissions {
            let values = emission.label_values();
            gauge.with_label_values(&values[..]).set(emission.value);
        }
        Ok(gauge.collect())
    }
}
