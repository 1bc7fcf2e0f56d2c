// Adaptive scan scheduling: recent hits pin the cadence to the hit
// cooldown, an off-whitelist foreground drops to the idle interval,
// and consecutive misses back off exponentially from the active
// interval up to a clamp. The scheduler is single-threaded state owned
// by the scanner; callers pass `now` so behavior is deterministic.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub active_scan_interval_ms: u64,
    pub idle_scan_interval_ms: u64,
    pub miss_backoff_ms_max: u64,
    pub hit_cooldown_ms: u64,
    /// Lowercased process image names treated as "active" foreground.
    pub process_whitelist: Vec<String>,
}

impl SchedulerConfig {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            active_scan_interval_ms: cfg.active_scan_interval_ms,
            idle_scan_interval_ms: cfg.idle_scan_interval_ms,
            miss_backoff_ms_max: cfg.miss_backoff_ms_max,
            hit_cooldown_ms: cfg.hit_cooldown_ms,
            process_whitelist: cfg
                .process_whitelist
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }
}

pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    miss_count: u32,
    last_hit: Option<Instant>,
    foreground_on_whitelist: bool,
}

/// Exponent cap; beyond this the clamp always wins.
const MAX_BACKOFF_EXP: u32 = 20;

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            miss_count: 0,
            last_hit: None,
            // Until a foreground change is observed, assume active.
            foreground_on_whitelist: true,
        }
    }

    /// Delay before the next scan tick.
    pub fn next_delay(&self, now: Instant) -> Duration {
        let cfg = &self.config;

        if let Some(hit) = self.last_hit {
            if now.duration_since(hit) < Duration::from_millis(cfg.hit_cooldown_ms) {
                return Duration::from_millis(cfg.hit_cooldown_ms);
            }
        }

        if !self.foreground_on_whitelist {
            return Duration::from_millis(cfg.idle_scan_interval_ms);
        }

        let exp = self.miss_count.min(MAX_BACKOFF_EXP);
        let backed_off = cfg
            .active_scan_interval_ms
            .saturating_mul(1u64 << exp)
            .min(cfg.miss_backoff_ms_max)
            .max(cfg.active_scan_interval_ms);
        Duration::from_millis(backed_off)
    }

    pub fn on_hit(&mut self, now: Instant) {
        self.miss_count = 0;
        self.last_hit = Some(now);
    }

    pub fn on_miss(&mut self) {
        self.miss_count = self.miss_count.saturating_add(1);
    }

    /// Foreground process changed: update whitelist membership and
    /// reset the backoff to its minimum.
    pub fn on_foreground_change(&mut self, process: Option<&str>) {
        self.foreground_on_whitelist = match process {
            Some(name) => {
                let name = name.to_lowercase();
                self.config.process_whitelist.iter().any(|p| *p == name)
            }
            None => false,
        };
        self.miss_count = 0;
    }

    pub fn foreground_on_whitelist(&self) -> bool {
        self.foreground_on_whitelist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            active_scan_interval_ms: 120,
            idle_scan_interval_ms: 2000,
            miss_backoff_ms_max: 5000,
            hit_cooldown_ms: 4000,
            process_whitelist: vec!["code.exe".into(), "cursor.exe".into()],
        }
    }

    #[test]
    fn test_active_baseline() {
        let s = AdaptiveScheduler::new(config());
        assert_eq!(s.next_delay(Instant::now()), Duration::from_millis(120));
    }

    #[test]
    fn test_miss_backoff_doubles_and_clamps() {
        let mut s = AdaptiveScheduler::new(config());
        let now = Instant::now();
        let expected = [120u64, 240, 480, 960, 1920, 3840, 5000, 5000];
        for want in expected {
            assert_eq!(s.next_delay(now), Duration::from_millis(want));
            s.on_miss();
        }
    }

    #[test]
    fn test_hit_pins_cooldown_and_resets_backoff() {
        let mut s = AdaptiveScheduler::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            s.on_miss();
        }
        s.on_hit(now);
        // Within the cooldown window the delay is exactly the cooldown.
        assert_eq!(s.next_delay(now), Duration::from_millis(4000));
        // After the window, backoff restarts from the active interval.
        let later = now + Duration::from_millis(4001);
        assert_eq!(s.next_delay(later), Duration::from_millis(120));
    }

    #[test]
    fn test_off_whitelist_idles() {
        let mut s = AdaptiveScheduler::new(config());
        s.on_foreground_change(Some("explorer.exe"));
        assert!(!s.foreground_on_whitelist());
        assert_eq!(s.next_delay(Instant::now()), Duration::from_millis(2000));

        // Misses do not alter the idle interval.
        s.on_miss();
        s.on_miss();
        assert_eq!(s.next_delay(Instant::now()), Duration::from_millis(2000));
    }

    #[test]
    fn test_foreground_switch_resets_backoff() {
        let mut s = AdaptiveScheduler::new(config());
        for _ in 0..6 {
            s.on_miss();
        }
        // Case-insensitive whitelist comparison.
        s.on_foreground_change(Some("Code.exe"));
        assert!(s.foreground_on_whitelist());
        assert_eq!(s.next_delay(Instant::now()), Duration::from_millis(120));
    }

    #[test]
    fn test_no_foreground_counts_as_idle() {
        let mut s = AdaptiveScheduler::new(config());
        s.on_foreground_change(None);
        assert_eq!(s.next_delay(Instant::now()), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_stays_in_contract_bounds() {
        let cfg = config();
        let lo = Duration::from_millis(cfg.active_scan_interval_ms);
        let hi = Duration::from_millis(
            cfg.idle_scan_interval_ms
                .max(cfg.miss_backoff_ms_max)
                .max(cfg.hit_cooldown_ms),
        );

        let mut s = AdaptiveScheduler::new(cfg);
        let now = Instant::now();
        for i in 0..64 {
            let d = s.next_delay(now);
            assert!(d >= lo && d <= hi, "delay {d:?} out of [{lo:?}, {hi:?}]");
            match i % 7 {
                0 => s.on_hit(now - Duration::from_millis(10_000)),
                1 => s.on_foreground_change(Some("cursor.exe")),
                2 => s.on_foreground_change(Some("notepad.exe")),
                _ => s.on_miss(),
            }
        }
    }
}
