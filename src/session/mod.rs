mod window;

pub use window::SampleWindow;

use crate::telemetry::{Channel, TelemetrySample};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    Online,
    Stale,
    Offline,
}

impl Connectivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Connectivity::Online => "ONLINE",
            Connectivity::Stale => "STALE",
            Connectivity::Offline => "OFFLINE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => Some(Connectivity::Online),
            "STALE" => Some(Connectivity::Stale),
            "OFFLINE" => Some(Connectivity::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityTransition {
    pub device_id: String,
    pub tenant_id: String,
    /// `None` when the device is seen for the first time.
    pub from: Option<Connectivity>,
    pub to: Connectivity,
    pub at: DateTime<Utc>,
}

/// Live state for one device. Only the shard owning the device mutates it.
#[derive(Debug)]
pub struct DeviceSession {
    device_id: String,
    tenant_id: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    connectivity: Connectivity,
    connectivity_since: DateTime<Utc>,
    last_samples: BTreeMap<Channel, TelemetrySample>,
    last_received: BTreeMap<Channel, DateTime<Utc>>,
    windows: BTreeMap<Channel, SampleWindow>,
}

impl DeviceSession {
    fn new(sample: &TelemetrySample) -> Self {
        Self {
            device_id: sample.device_id.clone(),
            tenant_id: sample.tenant_id.clone(),
            first_seen_at: sample.received_at,
            last_seen_at: sample.received_at,
            connectivity: Connectivity::Online,
            connectivity_since: sample.received_at,
            last_samples: BTreeMap::new(),
            last_received: BTreeMap::new(),
            windows: BTreeMap::new(),
        }
    }

    fn apply(&mut self, sample: TelemetrySample, window_capacity: usize) {
        let channel = sample.channel;
        self.tenant_id.clone_from(&sample.tenant_id);
        update_max(&mut self.last_seen_at, sample.received_at);
        self.last_received
            .entry(channel)
            .and_modify(|at| update_max(at, sample.received_at))
            .or_insert(sample.received_at);

        self.windows
            .entry(channel)
            .or_insert_with(|| SampleWindow::new(window_capacity))
            .push(sample.clone());

        let newer = self
            .last_samples
            .get(&channel)
            .map_or(true, |prev| sample.observed_at >= prev.observed_at);
        if newer {
            self.last_samples.insert(channel, sample);
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    pub fn last_sample(&self, channel: Channel) -> Option<&TelemetrySample> {
        self.last_samples.get(&channel)
    }

    pub fn last_received(&self, channel: Channel) -> Option<DateTime<Utc>> {
        self.last_received.get(&channel).copied()
    }

    pub fn window(&self, channel: Channel) -> Option<&SampleWindow> {
        self.windows.get(&channel)
    }

    pub fn snapshot(&self) -> DeviceSessionState {
        DeviceSessionState {
            device_id: self.device_id.clone(),
            tenant_id: self.tenant_id.clone(),
            connectivity: self.connectivity,
            connectivity_since: self.connectivity_since,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
            last_sample_per_channel: self.last_samples.clone(),
        }
    }
}

/// Read-only copy handed to queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSessionState {
    pub device_id: String,
    pub tenant_id: String,
    pub connectivity: Connectivity,
    pub connectivity_since: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_sample_per_channel: BTreeMap<Channel, TelemetrySample>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, DeviceSession>,
    window_capacity: usize,
    stale_after: ChronoDuration,
    offline_after: ChronoDuration,
}

impl SessionRegistry {
    pub fn new(
        window_capacity: usize,
        stale_after: ChronoDuration,
        offline_after: ChronoDuration,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            window_capacity,
            stale_after,
            offline_after,
        }
    }

    /// Applies an accepted sample. Returns a transition when the device was
    /// unseen, stale or offline before this sample.
    pub fn update(&mut self, sample: TelemetrySample) -> Option<ConnectivityTransition> {
        let received_at = sample.received_at;
        match self.sessions.entry(sample.device_id.clone()) {
            Entry::Vacant(slot) => {
                let session = slot.insert(DeviceSession::new(&sample));
                session.apply(sample, self.window_capacity);
                Some(ConnectivityTransition {
                    device_id: session.device_id.clone(),
                    tenant_id: session.tenant_id.clone(),
                    from: None,
                    to: Connectivity::Online,
                    at: received_at,
                })
            }
            Entry::Occupied(slot) => {
                let session = slot.into_mut();
                session.apply(sample, self.window_capacity);
                if session.connectivity == Connectivity::Online {
                    return None;
                }
                let from = session.connectivity;
                session.connectivity = Connectivity::Online;
                session.connectivity_since = received_at;
                Some(ConnectivityTransition {
                    device_id: session.device_id.clone(),
                    tenant_id: session.tenant_id.clone(),
                    from: Some(from),
                    to: Connectivity::Online,
                    at: received_at,
                })
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceSessionState> {
        self.sessions.get(device_id).map(DeviceSession::snapshot)
    }

    pub fn session(&self, device_id: &str) -> Option<&DeviceSession> {
        self.sessions.get(device_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DeviceSession> {
        self.sessions.values()
    }

    /// Downgrades devices that stopped reporting. A device idle past the
    /// offline threshold moves through STALE and OFFLINE in the same sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<ConnectivityTransition> {
        let mut transitions = Vec::new();
        for session in self.sessions.values_mut() {
            let idle = now - session.last_seen_at;
            if session.connectivity == Connectivity::Online && idle > self.stale_after {
                transitions.push(ConnectivityTransition {
                    device_id: session.device_id.clone(),
                    tenant_id: session.tenant_id.clone(),
                    from: Some(Connectivity::Online),
                    to: Connectivity::Stale,
                    at: now,
                });
                session.connectivity = Connectivity::Stale;
                session.connectivity_since = now;
            }
            if session.connectivity == Connectivity::Stale && idle > self.offline_after {
                transitions.push(ConnectivityTransition {
                    device_id: session.device_id.clone(),
                    tenant_id: session.tenant_id.clone(),
                    from: Some(Connectivity::Stale),
                    to: Connectivity::Offline,
                    at: now,
                });
                session.connectivity = Connectivity::Offline;
                session.connectivity_since = now;
            }
        }
        transitions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        transitions
    }

    pub fn remove(&mut self, device_id: &str) -> bool {
        self.sessions.remove(device_id).is_some()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }
}

fn update_max(current: &mut DateTime<Utc>, candidate: DateTime<Utc>) {
    if candidate > *current {
        *current = candidate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SampleValue;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn sample(channel: Channel, value: f64, observed: i64, received: i64) -> TelemetrySample {
        TelemetrySample {
            device_id: "RO-2025-0001".to_string(),
            tenant_id: "1".to_string(),
            channel,
            value: SampleValue::Number(value),
            unit: None,
            observed_at: base() + ChronoDuration::seconds(observed),
            received_at: base() + ChronoDuration::seconds(received),
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            8,
            ChronoDuration::seconds(60),
            ChronoDuration::seconds(300),
        )
    }

    #[test]
    fn first_sample_creates_session_and_goes_online() {
        let mut reg = registry();
        let transition = reg.update(sample(Channel::Flow, 3.0, 0, 0)).expect("transition");
        assert_eq!(transition.from, None);
        assert_eq!(transition.to, Connectivity::Online);
        assert!(reg.update(sample(Channel::Flow, 3.1, 1, 1)).is_none());
        let state = reg.get("RO-2025-0001").expect("state");
        assert_eq!(state.connectivity, Connectivity::Online);
        assert_eq!(state.last_seen_at, base() + ChronoDuration::seconds(1));
    }

    #[test]
    fn replaying_a_sample_is_idempotent() {
        let mut reg = registry();
        let s = sample(Channel::PressureIn, 4.2, 10, 10);
        reg.update(s.clone());
        let once = reg.get("RO-2025-0001").expect("state");
        reg.update(s);
        let twice = reg.get("RO-2025-0001").expect("state");
        assert_eq!(once, twice);
        let window = reg
            .session("RO-2025-0001")
            .and_then(|session| session.window(Channel::PressureIn))
            .expect("window");
        assert_eq!(window.iter().count(), 1);
    }

    #[test]
    fn older_samples_do_not_overwrite_last_values() {
        let mut reg = registry();
        reg.update(sample(Channel::PressureIn, 4.0, 20, 20));
        reg.update(sample(Channel::PressureIn, 9.0, 5, 25));
        let state = reg.get("RO-2025-0001").expect("state");
        let last = &state.last_sample_per_channel[&Channel::PressureIn];
        assert_eq!(last.value, SampleValue::Number(4.0));
        assert_eq!(state.last_seen_at, base() + ChronoDuration::seconds(25));

        // receipt time never moves backwards either
        reg.update(sample(Channel::Flow, 1.0, 30, 22));
        let state = reg.get("RO-2025-0001").expect("state");
        assert_eq!(state.last_seen_at, base() + ChronoDuration::seconds(25));
    }

    #[test]
    fn sweep_walks_online_stale_offline_exactly_once() {
        let mut reg = registry();
        reg.update(sample(Channel::Flow, 3.0, 0, 0));

        assert!(reg.sweep(base() + ChronoDuration::seconds(30)).is_empty());

        let stale = reg.sweep(base() + ChronoDuration::seconds(90));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].from, Some(Connectivity::Online));
        assert_eq!(stale[0].to, Connectivity::Stale);
        assert!(reg.sweep(base() + ChronoDuration::seconds(120)).is_empty());

        let offline = reg.sweep(base() + ChronoDuration::seconds(400));
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].to, Connectivity::Offline);
        assert!(reg.sweep(base() + ChronoDuration::seconds(900)).is_empty());

        let back = reg.update(sample(Channel::Flow, 3.0, 1000, 1000)).expect("reconnect");
        assert_eq!(back.from, Some(Connectivity::Offline));
        assert_eq!(back.to, Connectivity::Online);
    }

    #[test]
    fn long_silence_emits_both_downgrades_in_one_sweep() {
        let mut reg = registry();
        reg.update(sample(Channel::Flow, 3.0, 0, 0));
        let transitions = reg.sweep(base() + ChronoDuration::seconds(1000));
        let states: Vec<Connectivity> = transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![Connectivity::Stale, Connectivity::Offline]);
    }

    #[test]
    fn remove_drops_the_session() {
        let mut reg = registry();
        reg.update(sample(Channel::Flow, 3.0, 0, 0));
        assert!(reg.remove("RO-2025-0001"));
        assert!(reg.get("RO-2025-0001").is_none());
        assert!(!reg.remove("RO-2025-0001"));
    }
}
