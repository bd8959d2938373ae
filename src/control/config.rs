use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::resources::{
    ComputationLocation, Digest, DigestKind, DigestUpdate, Digests, EventUpdate, Events,
    LimiterConfig, Rule, SampleType, SamplingConfig, Stream, StreamUpdate, Streams, UpdateOp,
};

/// Desired configuration of a logical sampler.
///
/// Every sub-resource is independently nullable: `None` means the sampler keeps
/// its built-in default, which is not the same as an empty set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub streams: Option<Streams>,
    pub limiter_in: Option<LimiterConfig>,
    pub sampling_in: Option<SamplingConfig>,
    pub limiter_out: Option<LimiterConfig>,
    pub digests: Option<Digests>,
    pub events: Option<Events>,
}

/// Sub-resources to clear before an update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigReset {
    pub streams: bool,
    pub limiter_in: bool,
    pub sampling_in: bool,
    pub limiter_out: bool,
    pub digests: bool,
    pub events: bool,
}

/// A diff against a [`SamplerConfig`], applied with [`SamplerConfig::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplerConfigUpdate {
    pub reset: ConfigReset,
    pub stream_updates: Vec<StreamUpdate>,
    pub limiter_in: Option<LimiterConfig>,
    pub sampling_in: Option<SamplingConfig>,
    pub limiter_out: Option<LimiterConfig>,
    pub digest_updates: Vec<DigestUpdate>,
    pub event_updates: Vec<EventUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {kind} name {name}, expected alphanumerical with ./()-_ characters")]
    InvalidName { kind: &'static str, name: String },
    #[error("invalid sample type {0}")]
    InvalidSampleType(SampleType),
}

/// All violations found while validating one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub errors: Vec<ConfigError>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.errors.iter().enumerate() {
            if idx > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '(' | ')' | '-'))
}

fn check_name(kind: &'static str, name: &str, errors: &mut Vec<ConfigError>) {
    if !valid_name(name) {
        errors.push(ConfigError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
}

impl SamplerConfig {
    /// Config with every map-shaped sub-resource present but empty.
    pub fn new() -> Self {
        Self {
            streams: Some(Streams::new()),
            digests: Some(Digests::new()),
            events: Some(Events::new()),
            ..Self::default()
        }
    }

    /// Config given to samplers the server learns about only through collected samples:
    /// one stream capturing everything plus collector-side structure and value digests.
    pub fn implicit() -> Self {
        let stream_uid = Uuid::new_v4().to_string();
        let mut config = Self::new();
        let mut stream = Stream::new(stream_uid.clone(), "all", Rule::default());
        stream.export_raw_samples = true;
        stream.max_sample_size = 10240;
        config.streams = Some(Streams::from([(stream_uid.clone(), stream)]));

        let digest = |name: &str, kind: DigestKind| Digest {
            uid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            stream_uid: stream_uid.clone(),
            flush_period: Duration::from_secs(60),
            buffer_size: 0,
            computation_location: ComputationLocation::Collector,
            kind,
        };
        let st = digest(
            "struct",
            DigestKind::St {
                max_processed_fields: 100,
            },
        );
        let value = digest(
            "value",
            DigestKind::Value {
                max_processed_fields: 100,
            },
        );
        config.digests = Some(Digests::from([
            (st.uid.clone(), st),
            (value.uid.clone(), value),
        ]));
        config
    }

    pub fn is_empty(&self) -> bool {
        self.streams.as_ref().map_or(true, |s| s.is_empty())
            && self.limiter_in.is_none()
            && self.sampling_in.is_none()
            && self.limiter_out.is_none()
            && self.digests.as_ref().map_or(true, |d| d.is_empty())
            && self.events.as_ref().map_or(true, |e| e.is_empty())
    }

    /// Applies `update` in place.
    ///
    /// # Behavior
    /// * A sub-resource whose reset flag is set is cleared first, then the update's
    ///   upserts/deletes or new scalar value are applied on top.
    /// * Scalar sub-resources (limiters, sampling) are replaced only when the update
    ///   carries a value; otherwise they are left untouched.
    /// * Map sub-resources that are absent are initialized to empty before applying.
    pub fn merge(&mut self, update: &SamplerConfigUpdate) {
        let streams = reset_map(&mut self.streams, update.reset.streams);
        for change in &update.stream_updates {
            match change.op {
                UpdateOp::Upsert => {
                    streams.insert(change.stream.uid.clone(), change.stream.clone());
                }
                UpdateOp::Delete => {
                    streams.remove(&change.stream.uid);
                }
            }
        }

        if update.reset.limiter_in {
            self.limiter_in = None;
        }
        if let Some(limiter) = update.limiter_in {
            self.limiter_in = Some(limiter);
        }

        if update.reset.sampling_in {
            self.sampling_in = None;
        }
        if let Some(sampling) = update.sampling_in {
            self.sampling_in = Some(sampling);
        }

        if update.reset.limiter_out {
            self.limiter_out = None;
        }
        if let Some(limiter) = update.limiter_out {
            self.limiter_out = Some(limiter);
        }

        let digests = reset_map(&mut self.digests, update.reset.digests);
        for change in &update.digest_updates {
            match change.op {
                UpdateOp::Upsert => {
                    digests.insert(change.digest.uid.clone(), change.digest.clone());
                }
                UpdateOp::Delete => {
                    digests.remove(&change.digest.uid);
                }
            }
        }

        let events = reset_map(&mut self.events, update.reset.events);
        for change in &update.event_updates {
            match change.op {
                UpdateOp::Upsert => {
                    events.insert(change.event.uid.clone(), change.event.clone());
                }
                UpdateOp::Delete => {
                    events.remove(&change.event.uid);
                }
            }
        }
    }
}

fn reset_map<K, V>(
    slot: &mut Option<std::collections::HashMap<K, V>>,
    reset: bool,
) -> &mut std::collections::HashMap<K, V> {
    if reset {
        *slot = None;
    }
    slot.get_or_insert_with(std::collections::HashMap::new)
}

impl SamplerConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_stream(mut self, stream: Stream) -> Self {
        self.stream_updates.push(StreamUpdate {
            op: UpdateOp::Upsert,
            stream,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Checks resource names and event sample types, collecting every violation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();
        for change in &self.digest_updates {
            check_name("digest", &change.digest.name, &mut errors);
        }
        for change in &self.event_updates {
            check_name("event", &change.event.name, &mut errors);
            if change.op == UpdateOp::Upsert && change.event.sample_type != SampleType::Raw {
                errors.push(ConfigError::InvalidSampleType(change.event.sample_type));
            }
        }
        for change in &self.stream_updates {
            check_name("stream", &change.stream.name, &mut errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::resources::Event;

    fn stream(uid: &str, expr: &str) -> Stream {
        Stream::new(uid, format!("stream-{uid}"), Rule::cel(expr))
    }

    #[test]
    fn reset_then_upsert_keeps_only_upserted_stream() {
        let mut config = SamplerConfig::new();
        config.merge(&SamplerConfigUpdate::new().upsert_stream(stream("a", "x > 1")));
        config.merge(&SamplerConfigUpdate::new().upsert_stream(stream("b", "x > 2")));

        let mut update = SamplerConfigUpdate::new().upsert_stream(stream("c", "x > 3"));
        update.reset.streams = true;
        config.merge(&update);

        let streams = config.streams.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams["c"].rule.expression, "x > 3");
    }

    #[test]
    fn limiter_out_update_does_not_touch_limiter_in() {
        let mut config = SamplerConfig::new();
        config.merge(&SamplerConfigUpdate {
            limiter_in: Some(LimiterConfig { limit: 10 }),
            ..SamplerConfigUpdate::default()
        });
        config.merge(&SamplerConfigUpdate {
            limiter_out: Some(LimiterConfig { limit: 99 }),
            ..SamplerConfigUpdate::default()
        });

        assert_eq!(config.limiter_in, Some(LimiterConfig { limit: 10 }));
        assert_eq!(config.limiter_out, Some(LimiterConfig { limit: 99 }));
    }

    #[test]
    fn untouched_scalars_survive_and_reset_without_value_clears() {
        let mut config = SamplerConfig::new();
        config.merge(&SamplerConfigUpdate {
            sampling_in: Some(SamplingConfig::Deterministic {
                sample_rate: 4,
                sample_empty_determinant: false,
            }),
            limiter_in: Some(LimiterConfig { limit: 5 }),
            ..SamplerConfigUpdate::default()
        });

        let mut update = SamplerConfigUpdate::new();
        update.reset.limiter_in = true;
        config.merge(&update);

        assert!(config.limiter_in.is_none());
        assert!(config.sampling_in.is_some());
    }

    #[test]
    fn merge_initializes_absent_maps() {
        let mut config = SamplerConfig::default();
        config.merge(&SamplerConfigUpdate::new());
        assert_eq!(config.streams, Some(Streams::new()));
        assert_eq!(config.events, Some(Events::new()));
        assert!(config.limiter_out.is_none());
    }

    #[test]
    fn delete_removes_stream_by_uid() {
        let mut config = SamplerConfig::new();
        config.merge(&SamplerConfigUpdate::new().upsert_stream(stream("a", "true")));
        config.merge(&SamplerConfigUpdate {
            stream_updates: vec![StreamUpdate {
                op: UpdateOp::Delete,
                stream: Stream::new("a", "", Rule::default()),
            }],
            ..SamplerConfigUpdate::default()
        });
        assert!(config.streams.unwrap().is_empty());
    }

    #[test]
    fn validation_reports_every_violation() {
        let event = Event {
            uid: "e1".into(),
            name: "bad name!".into(),
            stream_uid: "s".into(),
            sample_type: SampleType::StructDigest,
            rule: Rule::default(),
            limiter: LimiterConfig::default(),
            export_template: String::new(),
        };
        let update = SamplerConfigUpdate {
            event_updates: vec![EventUpdate {
                op: UpdateOp::Upsert,
                event,
            }],
            ..SamplerConfigUpdate::new().upsert_stream(stream("s", "true"))
        };

        let err = update.validate().unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.to_string().contains("invalid event name bad name!"));
        assert!(err.to_string().contains("invalid sample type struct-digest"));
    }

    #[test]
    fn implicit_config_has_all_stream_and_two_digests() {
        let config = SamplerConfig::implicit();
        let streams = config.streams.unwrap();
        assert_eq!(streams.len(), 1);
        let stream = streams.values().next().unwrap();
        assert_eq!(stream.name, "all");
        assert_eq!(stream.max_sample_size, 10240);
        assert_eq!(config.digests.unwrap().len(), 2);
    }
}
