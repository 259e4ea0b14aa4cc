use crate::collectors::system::parse_counter;
use crate::collectors::{CollectError, Sleeper};
use crate::snapshot::{round2, InterfaceRate, NetworkRates};
use std::collections::BTreeMap;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const NET_DEV_PATH: &str = "/proc/net/dev";
const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

/// Cumulative per-interface counters as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errin: u64,
    pub errout: u64,
    pub dropin: u64,
    pub dropout: u64,
}

pub trait CounterSource: Send + Sync {
    fn read(&self) -> Result<BTreeMap<String, InterfaceCounters>, CollectError>;
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcNetDev {
    path: PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcNetDev {
    fn default() -> Self {
        Self {
            path: PathBuf::from(NET_DEV_PATH),
        }
    }
}

#[cfg(target_os = "linux")]
impl CounterSource for ProcNetDev {
    fn read(&self) -> Result<BTreeMap<String, InterfaceCounters>, CollectError> {
        let text = fs::read_to_string(&self.path).map_err(|source| CollectError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        parse_net_dev(&text)
    }
}

/// Counter source for platforms without procfs. sysinfo reports no drop
/// counters, so `dropped` reads as zero there.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoNetworks;

#[cfg(not(target_os = "linux"))]
impl CounterSource for SysinfoNetworks {
    fn read(&self) -> Result<BTreeMap<String, InterfaceCounters>, CollectError> {
        use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};

        let mut system = System::new();
        system.refresh_networks_list();
        Ok(system
            .networks()
            .iter()
            .map(|(name, data)| {
                (
                    name.to_string(),
                    InterfaceCounters {
                        bytes_sent: data.total_transmitted(),
                        bytes_recv: data.total_received(),
                        packets_sent: data.total_packets_transmitted(),
                        packets_recv: data.total_packets_received(),
                        errin: data.total_errors_on_received(),
                        errout: data.total_errors_on_transmitted(),
                        dropin: 0,
                        dropout: 0,
                    },
                )
            })
            .collect())
    }
}

pub fn default_counter_source() -> Arc<dyn CounterSource> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcNetDev::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(SysinfoNetworks)
    }
}

/// Parses `/proc/net/dev`: two header lines, then
/// `iface: rx_bytes rx_packets rx_errs rx_drop ... tx_bytes tx_packets tx_errs tx_drop ...`.
pub fn parse_net_dev(text: &str) -> Result<BTreeMap<String, InterfaceCounters>, CollectError> {
    let mut out = BTreeMap::new();
    for line in text.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 16 {
            return Err(CollectError::Parse {
                path: NET_DEV_PATH.to_string(),
                reason: format!("interface {} has {} fields", name.trim(), fields.len()),
            });
        }

        let field = |idx: usize| parse_counter(fields[idx], NET_DEV_PATH);
        out.insert(
            name.trim().to_string(),
            InterfaceCounters {
                bytes_recv: field(0)?,
                packets_recv: field(1)?,
                errin: field(2)?,
                dropin: field(3)?,
                bytes_sent: field(8)?,
                packets_sent: field(9)?,
                errout: field(10)?,
                dropout: field(11)?,
            },
        );
    }
    Ok(out)
}

/// Megabits per second between two byte counter values. A counter that went
/// backwards yields a negative rate.
pub fn throughput_mbps(start: u64, end: u64, window: Duration) -> f64 {
    let delta = end as i128 - start as i128;
    let secs = window.as_secs_f64();
    let per_sec = if secs > 0.0 {
        delta as f64 / secs
    } else {
        delta as f64
    };
    round2(per_sec * 8.0 / BITS_PER_MEGABIT)
}

/// Differences two readings taken `window` apart. Interfaces missing from
/// either reading are dropped; cumulative fields come from `end`.
pub fn diff_readings(
    start: &BTreeMap<String, InterfaceCounters>,
    end: &BTreeMap<String, InterfaceCounters>,
    window: Duration,
) -> NetworkRates {
    end.iter()
        .filter_map(|(name, b)| {
            let a = start.get(name)?;
            Some((
                name.clone(),
                InterfaceRate {
                    sent_mbps: throughput_mbps(a.bytes_sent, b.bytes_sent, window),
                    recv_mbps: throughput_mbps(a.bytes_recv, b.bytes_recv, window),
                    bytes_sent: b.bytes_sent,
                    bytes_recv: b.bytes_recv,
                    packets_sent: b.packets_sent,
                    packets_recv: b.packets_recv,
                    errors: b.errin.saturating_add(b.errout),
                    dropped: b.dropin.saturating_add(b.dropout),
                },
            ))
        })
        .collect()
}

/// The first half of a rate measurement. Owns its reading, so concurrent
/// windows never observe each other's state.
#[derive(Debug)]
pub struct RateWindow {
    start: BTreeMap<String, InterfaceCounters>,
}

impl RateWindow {
    pub fn open(source: &dyn CounterSource) -> Result<Self, CollectError> {
        Ok(Self {
            start: source.read()?,
        })
    }

    pub fn close(
        self,
        source: &dyn CounterSource,
        window: Duration,
    ) -> Result<NetworkRates, CollectError> {
        let end = source.read()?;
        Ok(diff_readings(&self.start, &end, window))
    }
}

pub struct RateWindowSampler {
    source: Arc<dyn CounterSource>,
    sleeper: Arc<dyn Sleeper>,
    window: Duration,
}

impl RateWindowSampler {
    pub fn new(source: Arc<dyn CounterSource>, sleeper: Arc<dyn Sleeper>, window: Duration) -> Self {
        Self {
            source,
            sleeper,
            window,
        }
    }

    pub fn sample_rates(&self) -> Result<NetworkRates, CollectError> {
        self.sample_over(self.window)
    }

    pub fn sample_over(&self, window: Duration) -> Result<NetworkRates, CollectError> {
        let pending = RateWindow::open(self.source.as_ref())?;
        self.sleeper.sleep(window);
        pending.close(self.source.as_ref(), window)
    }
}

/// Replays a fixed sequence of readings; the last one repeats once exhausted.
#[cfg(test)]
pub(crate) struct ScriptedCounters {
    readings: std::sync::Mutex<std::collections::VecDeque<BTreeMap<String, InterfaceCounters>>>,
}

#[cfg(test)]
impl ScriptedCounters {
    pub fn new(readings: Vec<BTreeMap<String, InterfaceCounters>>) -> Self {
        Self {
            readings: std::sync::Mutex::new(readings.into()),
        }
    }
}

#[cfg(test)]
impl CounterSource for ScriptedCounters {
    fn read(&self) -> Result<BTreeMap<String, InterfaceCounters>, CollectError> {
        let mut readings = self.readings.lock().unwrap();
        if readings.len() > 1 {
            Ok(readings.pop_front().unwrap())
        } else {
            Ok(readings.front().cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::RecordingSleeper;

    struct DeniedCounters;

    impl CounterSource for DeniedCounters {
        fn read(&self) -> Result<BTreeMap<String, InterfaceCounters>, CollectError> {
            Err(CollectError::Io {
                path: NET_DEV_PATH.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }
    }

    fn reading(entries: &[(&str, u64, u64)]) -> BTreeMap<String, InterfaceCounters> {
        entries
            .iter()
            .map(|(name, sent, recv)| {
                (
                    name.to_string(),
                    InterfaceCounters {
                        bytes_sent: *sent,
                        bytes_recv: *recv,
                        packets_sent: 7,
                        packets_recv: 9,
                        errin: 1,
                        errout: 2,
                        dropin: 3,
                        dropout: 4,
                    },
                )
            })
            .collect()
    }

    fn sampler(readings: Vec<BTreeMap<String, InterfaceCounters>>) -> (RateWindowSampler, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let sampler = RateWindowSampler::new(
            Arc::new(ScriptedCounters::new(readings)),
            sleeper.clone(),
            Duration::from_secs(1),
        );
        (sampler, sleeper)
    }

    #[test]
    fn one_second_window_yields_mbps() {
        let (sampler, sleeper) = sampler(vec![
            reading(&[("eth0", 1000, 2000)]),
            reading(&[("eth0", 1000 + 131_072, 2000 + 262_144)]),
        ]);

        let rates = sampler.sample_rates().unwrap();
        let eth0 = &rates["eth0"];
        assert_eq!(eth0.sent_mbps, 1.0);
        assert_eq!(eth0.recv_mbps, 2.0);
        assert_eq!(eth0.bytes_sent, 1000 + 131_072);
        assert_eq!(eth0.bytes_recv, 2000 + 262_144);
        assert_eq!(eth0.packets_sent, 7);
        assert_eq!(eth0.errors, 3);
        assert_eq!(eth0.dropped, 7);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn interface_removed_mid_window_is_dropped() {
        let (sampler, _) = sampler(vec![
            reading(&[("eth0", 0, 0), ("wlan0", 0, 0)]),
            reading(&[("eth0", 10, 10), ("docker0", 5, 5)]),
        ]);

        let rates = sampler.sample_rates().unwrap();
        assert_eq!(rates.keys().collect::<Vec<_>>(), vec!["eth0"]);
    }

    #[test]
    fn counter_reset_reports_negative_rate() {
        let (sampler, _) = sampler(vec![
            reading(&[("eth0", 262_144, 131_072)]),
            reading(&[("eth0", 0, 131_072)]),
        ]);

        let rates = sampler.sample_rates().unwrap();
        assert_eq!(rates["eth0"].sent_mbps, -2.0);
        assert_eq!(rates["eth0"].recv_mbps, 0.0);
    }

    #[test]
    fn longer_window_is_normalised_per_second() {
        assert_eq!(throughput_mbps(0, 262_144, Duration::from_secs(2)), 1.0);
        assert_eq!(throughput_mbps(0, 131_072, Duration::from_millis(500)), 2.0);
    }

    #[test]
    fn read_failure_surfaces_as_error() {
        let sampler = RateWindowSampler::new(
            Arc::new(DeniedCounters),
            Arc::new(RecordingSleeper::default()),
            Duration::from_secs(1),
        );
        let err = sampler.sample_rates().unwrap_err();
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn windows_do_not_share_readings() {
        let source = ScriptedCounters::new(vec![
            reading(&[("eth0", 0, 0)]),
            reading(&[("eth0", 131_072, 0)]),
            reading(&[("eth0", 262_144, 0)]),
        ]);
        let first = RateWindow::open(&source).unwrap();
        let second = RateWindow::open(&source).unwrap();
        let second_rates = second.close(&source, Duration::from_secs(1)).unwrap();
        let first_rates = first.close(&source, Duration::from_secs(1)).unwrap();

        assert_eq!(second_rates["eth0"].sent_mbps, 1.0);
        assert_eq!(first_rates["eth0"].sent_mbps, 2.0);
    }

    #[test]
    fn parses_proc_net_dev() {
        let text = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 2776770   11307    0    0    0     0          0         0  2776770   11307    0    0    0     0       0          0
  eth0: 1215645    2751    1    2    0     0          0         0  1782404    4324    3    4    0     0       0          0
";
        let counters = parse_net_dev(text).unwrap();
        assert_eq!(counters.len(), 2);
        let eth0 = counters["eth0"];
        assert_eq!(eth0.bytes_recv, 1_215_645);
        assert_eq!(eth0.packets_recv, 2751);
        assert_eq!(eth0.bytes_sent, 1_782_404);
        assert_eq!(eth0.packets_sent, 4324);
        assert_eq!(eth0.errin + eth0.errout, 4);
        assert_eq!(eth0.dropin + eth0.dropout, 6);
    }

    #[test]
    fn truncated_net_dev_line_is_an_error() {
        let text = "h1\nh2\n  eth0: 1 2 3\n";
        assert!(matches!(
            parse_net_dev(text),
            Err(CollectError::Parse { .. })
        ));
    }
}
