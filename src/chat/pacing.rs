//! 发言节奏：要不要说、等多久
//!
//! 所有时长都从 [`PacingPolicy`] 取，随机数由调用方传入，方便测试固定结果。

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// 单段等待的上限
const MAX_DELAY: Duration = Duration::from_secs(600);

/// 秒数转时长；溢出、NaN、负数都落到上限以内
fn capped_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).map_or(MAX_DELAY, |v| v.min(MAX_DELAY))
}

/// 闭区间随机时长（毫秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let (lo, hi) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        Duration::from_millis(rng.gen_range(lo..=hi))
    }
}

/// [chat.pacing] 段
#[derive(Debug, Clone, Deserialize)]
pub struct PacingPolicy {
    /// 首次加入前的随机等待
    #[serde(default = "default_join")]
    pub join: DelayRange,
    /// 新章节开场时非群主额外等待
    #[serde(default = "default_chapter_hold")]
    pub chapter_hold: DelayRange,
    #[serde(default = "default_observe")]
    pub observe: DelayRange,
    /// 被强制发言时的观察基础时长
    #[serde(default = "default_forced_observe_ms")]
    pub forced_observe_ms: u64,
    #[serde(default = "default_reading_ms_per_char")]
    pub reading_ms_per_char: u64,
    #[serde(default = "default_reading_cap_ms")]
    pub reading_cap_ms: u64,
    /// 人类正在输入时观察时长的放大倍数
    #[serde(default = "default_typing_slowdown")]
    pub typing_slowdown: f64,
    #[serde(default = "default_compose")]
    pub compose: DelayRange,
    #[serde(default = "default_cooldown")]
    pub cooldown: DelayRange,
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    #[serde(default = "default_base_probability")]
    pub base_probability: f64,
    #[serde(default = "default_mention_probability")]
    pub mention_probability: f64,
    #[serde(default = "default_mention_urgency")]
    pub mention_urgency: f64,
    /// 群里还没有任何消息时的发言概率
    #[serde(default = "default_idle_probability")]
    pub idle_probability: f64,
}

fn default_join() -> DelayRange {
    DelayRange::new(500, 5000)
}

fn default_chapter_hold() -> DelayRange {
    DelayRange::new(2000, 4000)
}

fn default_observe() -> DelayRange {
    DelayRange::new(1000, 3000)
}

fn default_forced_observe_ms() -> u64 {
    500
}

fn default_reading_ms_per_char() -> u64 {
    50
}

fn default_reading_cap_ms() -> u64 {
    8000
}

fn default_typing_slowdown() -> f64 {
    2.5
}

fn default_compose() -> DelayRange {
    DelayRange::new(2000, 6000)
}

fn default_cooldown() -> DelayRange {
    DelayRange::new(2000, 5000)
}

fn default_pause_poll_ms() -> u64 {
    500
}

fn default_base_probability() -> f64 {
    0.5
}

fn default_mention_probability() -> f64 {
    0.95
}

fn default_mention_urgency() -> f64 {
    1.5
}

fn default_idle_probability() -> f64 {
    0.2
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            join: default_join(),
            chapter_hold: default_chapter_hold(),
            observe: default_observe(),
            forced_observe_ms: default_forced_observe_ms(),
            reading_ms_per_char: default_reading_ms_per_char(),
            reading_cap_ms: default_reading_cap_ms(),
            typing_slowdown: default_typing_slowdown(),
            compose: default_compose(),
            cooldown: default_cooldown(),
            pause_poll_ms: default_pause_poll_ms(),
            base_probability: default_base_probability(),
            mention_probability: default_mention_probability(),
            mention_urgency: default_mention_urgency(),
            idle_probability: default_idle_probability(),
        }
    }
}

/// 做决定时看到的局面
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub me: &'a str,
    pub my_nickname: &'a str,
    pub is_manager: bool,
    /// 当前章节还没有任何消息
    pub chapter_fresh: bool,
    /// 群里有群主，且群主不是最后发言者
    pub manager_can_open: bool,
    /// 最后一条消息的（作者, 内容）
    pub last: Option<(&'a str, &'a str)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Silent,
    Speak { urgency: f64, forced: bool },
}


/// 决定本轮是否发言；roll 取 [0, 1)
pub fn decide(ctx: &DecisionContext<'_>, roll: f64, policy: &PacingPolicy) -> Decision {
    if let Some((author, _)) = ctx.last {
        if author == ctx.me {
            return Decision::Silent;
        }
    }

    if ctx.chapter_fresh {
        if ctx.is_manager {
            return Decision::Speak {
                urgency: 1.0,
                forced: true,
            };
        }
        if ctx.manager_can_open {
            return Decision::Silent;
        }
    }

    let (probability, urgency) = match ctx.last {
        None => (policy.idle_probability, 1.0),
        Some((_, content))
            if content.contains(ctx.me)
                || (!ctx.my_nickname.is_empty() && content.contains(ctx.my_nickname)) =>
        {
            (policy.mention_probability, policy.mention_urgency)
        }
        Some(_) => (policy.base_probability, 1.0),
    };

    if roll < probability {
        Decision::Speak {
            urgency,
            forced: false,
        }
    } else {
        Decision::Silent
    }
}

impl PacingPolicy {
    /// 观察时长：基础 + 阅读时间（封顶），人类输入中再放大
    pub fn observe_delay<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        forced: bool,
        last_len_chars: usize,
        human_typing: bool,
    ) -> Duration {
        let base = if forced {
            Duration::from_millis(self.forced_observe_ms)
        } else {
            self.observe.sample(rng)
        };
        let reading = Duration::from_millis(
            (last_len_chars as u64)
                .saturating_mul(self.reading_ms_per_char)
                .min(self.reading_cap_ms),
        );
        let total = base + reading;
        if human_typing {
            capped_secs(total.as_secs_f64() * self.typing_slowdown.max(1.0))
        } else {
            total
        }
    }

    /// 打字时长，紧迫度越高越快
    pub fn compose_delay<R: Rng + ?Sized>(&self, rng: &mut R, urgency: f64) -> Duration {
        let d = self.compose.sample(rng);
        if urgency > 0.0 {
            capped_secs(d.as_secs_f64() / urgency)
        } else {
            d
        }
    }

    pub fn cooldown_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.cooldown.sample(rng)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ctx<'a>(last: Option<(&'a str, &'a str)>) -> DecisionContext<'a> {
        DecisionContext {
            me: "qwen-max",
            my_nickname: "千问",
            is_manager: false,
            chapter_fresh: false,
            manager_can_open: false,
            last,
        }
    }

    #[test]
    fn test_never_speaks_after_own_message() {
        let p = PacingPolicy::default();
        let mut c = ctx(Some(("qwen-max", "我说完了")));
        c.is_manager = true;
        c.chapter_fresh = true;
        assert_eq!(decide(&c, 0.0, &p), Decision::Silent);
    }

    #[test]
    fn test_fresh_chapter_gate() {
        let p = PacingPolicy::default();
        let mut manager = ctx(Some(("Gaia", "嗨")));
        manager.is_manager = true;
        manager.chapter_fresh = true;
        assert!(matches!(
            decide(&manager, 0.99, &p),
            Decision::Speak { forced: true, .. }
        ));

        let mut member = ctx(Some(("Gaia", "嗨")));
        member.chapter_fresh = true;
        member.manager_can_open = true;
        assert_eq!(decide(&member, 0.0, &p), Decision::Silent);

        // 群主正是最后发言者时，其他人可以接话
        member.manager_can_open = false;
        assert!(matches!(decide(&member, 0.0, &p), Decision::Speak { .. }));
    }

    #[test]
    fn test_probabilities() {
        let p = PacingPolicy::default();
        assert_eq!(decide(&ctx(None), 0.19, &p), Decision::Speak { urgency: 1.0, forced: false });
        assert_eq!(decide(&ctx(None), 0.21, &p), Decision::Silent);

        let mention = ctx(Some(("deepseek-v3", "@千问 你来说说")));
        assert_eq!(
            decide(&mention, 0.9, &p),
            Decision::Speak { urgency: 1.5, forced: false }
        );
        let by_key = ctx(Some(("deepseek-v3", "qwen-max 在吗")));
        assert!(matches!(decide(&by_key, 0.9, &p), Decision::Speak { .. }));

        let plain = ctx(Some(("deepseek-v3", "今天好热")));
        assert_eq!(decide(&plain, 0.6, &p), Decision::Silent);
        assert!(matches!(decide(&plain, 0.4, &p), Decision::Speak { .. }));
    }

    #[test]
    fn test_observe_delay_bounds() {
        let p = PacingPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let forced = p.observe_delay(&mut rng, true, 1000, false);
        assert_eq!(forced, Duration::from_millis(500 + 8000));

        let typing = p.observe_delay(&mut rng, true, 10, true);
        assert_eq!(typing, Duration::from_millis(1000).mul_f64(2.5));

        for _ in 0..50 {
            let d = p.observe_delay(&mut rng, false, 0, false);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_compose_delay_scaled_by_urgency() {
        let p = PacingPolicy {
            compose: DelayRange::new(3000, 3000),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(p.compose_delay(&mut rng, 1.5), Duration::from_millis(2000));
        assert_eq!(p.compose_delay(&mut rng, 1.0), Duration::from_millis(3000));
    }

    #[test]
    fn test_extreme_factors_stay_capped() {
        let p = PacingPolicy {
            typing_slowdown: f64::INFINITY,
            mention_urgency: 1e-300,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(p.observe_delay(&mut rng, true, 0, true), MAX_DELAY);
        assert_eq!(p.compose_delay(&mut rng, p.mention_urgency), MAX_DELAY);
        assert_eq!(p.compose_delay(&mut rng, f64::INFINITY), Duration::ZERO);
        assert!(p.compose_delay(&mut rng, f64::NAN) <= Duration::from_millis(6000));

        let nan = PacingPolicy {
            typing_slowdown: f64::NAN,
            ..Default::default()
        };
        assert_eq!(
            nan.observe_delay(&mut rng, true, 0, true),
            Duration::from_millis(500)
        );
    }
}
