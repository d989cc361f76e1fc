//! 总线诊断统计
//!
//! 默认关闭，由控制子协议开启。飞行时间按 2 的幂分桶：
//! 第 `i` 个桶统计 `[2^(i-1), 2^i)` 微秒（第 0 个桶只统计 0）。

const BUCKETS: usize = 40;

#[derive(Debug, Clone)]
pub struct Statistics {
    enabled: bool,
    method_calls: u64,
    signals_emitted: u64,
    flight_times: [u64; BUCKETS],
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            enabled: false,
            method_calls: 0,
            signals_emitted: 0,
            flight_times: [0; BUCKETS],
        }
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 开启时清零所有计数
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            *self = Self {
                enabled: true,
                ..Self::default()
            };
        }
        self.enabled = enabled;
    }

    pub fn record_call(&mut self) {
        if self.enabled {
            self.method_calls += 1;
        }
    }

    pub fn record_signal(&mut self) {
        if self.enabled {
            self.signals_emitted += 1;
        }
    }

    pub fn record_flight_time(&mut self, micros: u64) {
        if !self.enabled {
            return;
        }
        let bucket = (u64::BITS - micros.leading_zeros()) as usize;
        self.flight_times[bucket.min(BUCKETS - 1)] += 1;
    }

    pub fn method_calls(&self) -> u64 {
        self.method_calls
    }

    pub fn signals_emitted(&self) -> u64 {
        self.signals_emitted
    }

    /// 非空桶：(桶上界微秒, 计数)
    pub fn histogram(&self) -> Vec<(u64, u64)> {
        self.flight_times
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| (1u64 << i, *count))
            .collect()
    }
}
