//! 暗网拍卖会：Closed → Open → Closed
//!
//! 开拍后只有非拍卖师的出价且高于当前价才生效；只有拍卖师能落槌成交。

use serde::Serialize;

/// 一条有效出价
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidRecord {
    pub bidder: String,
    pub price: f64,
    pub reason: String,
}

/// 出价结果
#[derive(Debug, Clone, PartialEq)]
pub enum BidOutcome {
    Accepted { price: f64 },
    /// 不高于当前价，调用方降级为普通文本
    TooLow { price: f64, current: f64 },
    /// 拍卖未开启或出价人是拍卖师
    Ignored,
}

/// 成交结果
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub item: String,
    pub winner: Option<String>,
    pub price: f64,
}

/// 拍卖状态
#[derive(Debug, Clone, Default, Serialize)]
pub struct Auction {
    pub enabled: bool,
    pub item: String,
    pub description: String,
    pub current_price: f64,
    pub highest_bidder: Option<String>,
    pub auctioneer: String,
    pub ledger: Vec<BidRecord>,
}

impl Auction {
    /// 开拍：重置全部状态
    pub fn open(
        &mut self,
        item: impl Into<String>,
        description: impl Into<String>,
        starting_price: f64,
        auctioneer: impl Into<String>,
    ) {
        *self = Auction {
            enabled: true,
            item: item.into(),
            description: description.into(),
            current_price: starting_price,
            highest_bidder: None,
            auctioneer: auctioneer.into(),
            ledger: Vec::new(),
        };
        tracing::info!(
            "Auction opened: {} (start {}) by {}",
            self.item,
            self.current_price,
            self.auctioneer
        );
    }

    pub fn is_open(&self) -> bool {
        self.enabled
    }

    pub fn is_auctioneer(&self, who: &str) -> bool {
        self.enabled && self.auctioneer == who
    }

    pub fn bid(&mut self, bidder: &str, price: f64, reason: &str) -> BidOutcome {
        if !self.enabled || self.auctioneer == bidder || !price.is_finite() {
            return BidOutcome::Ignored;
        }
        if price <= self.current_price {
            return BidOutcome::TooLow {
                price,
                current: self.current_price,
            };
        }
        self.current_price = price;
        self.highest_bidder = Some(bidder.to_string());
        self.ledger.push(BidRecord {
            bidder: bidder.to_string(),
            price,
            reason: reason.to_string(),
        });
        BidOutcome::Accepted { price }
    }

    /// 落槌：只有拍卖师有效，成功后拍卖关闭
    pub fn hammer(
        &mut self,
        actor: &str,
        winner: Option<String>,
        price: Option<f64>,
    ) -> Option<Settlement> {
        if !self.is_auctioneer(actor) {
            return None;
        }
        let settlement = Settlement {
            item: self.item.clone(),
            winner: winner.or_else(|| self.highest_bidder.clone()),
            price: price.unwrap_or(self.current_price),
        };
        self.enabled = false;
        Some(settlement)
    }

    /// 运维强制结束（按当前最高价结算）
    pub fn close(&mut self) -> Option<Settlement> {
        if !self.enabled {
            return None;
        }
        self.enabled = false;
        Some(Settlement {
            item: self.item.clone(),
            winner: self.highest_bidder.clone(),
            price: self.current_price,
        })
    }

    /// 开拍公告
    pub fn announcement(&self, auctioneer_display: &str) -> String {
        format!(
            "🔨【暗网拍卖会开启】\n拍品：{}\n描述：{}\n起拍价：{}\n拍卖师：{}",
            self.item, self.description, self.current_price, auctioneer_display
        )
    }
}

impl Settlement {
    /// 落槌时写入历史的那句话
    pub fn hammer_line(&self, winner_display: &str) -> String {
        format!("🔨 [成交] 恭喜 {} 以 {} 拍得拍品！", winner_display, self.price)
    }

    /// 拍卖结束的系统公告
    pub fn closing_notice(&self, winner_display: &str) -> String {
        format!(
            "🔨【拍卖结束】\n恭喜 {} 以 {} 拍得 {}！",
            winner_display, self.price, self.item
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_auction() -> Auction {
        let mut a = Auction::default();
        a.open("一段不存在的记忆", "无法描述", 100.0, "host");
        a
    }

    #[test]
    fn test_price_non_decreasing_over_bid_sequence() {
        let mut a = open_auction();
        let bids = [("a", 120.0), ("b", 110.0), ("b", 150.0), ("a", 150.0), ("host", 999.0), ("a", 151.0)];
        let mut last_price = a.current_price;
        let mut last_bidder = a.highest_bidder.clone();
        for (who, price) in bids {
            let before = a.current_price;
            let outcome = a.bid(who, price, "");
            assert!(a.current_price >= last_price);
            if a.highest_bidder != last_bidder {
                assert!(a.current_price > before);
                assert!(matches!(outcome, BidOutcome::Accepted { .. }));
            }
            last_price = a.current_price;
            last_bidder = a.highest_bidder.clone();
        }
        assert_eq!(a.current_price, 151.0);
        assert_eq!(a.highest_bidder.as_deref(), Some("a"));
        assert_eq!(a.ledger.len(), 3);
    }

    #[test]
    fn test_too_low_and_auctioneer_bids() {
        let mut a = open_auction();
        assert_eq!(
            a.bid("a", 100.0, "同价"),
            BidOutcome::TooLow {
                price: 100.0,
                current: 100.0
            }
        );
        assert_eq!(a.bid("host", 500.0, ""), BidOutcome::Ignored);
        assert_eq!(a.current_price, 100.0);
    }

    #[test]
    fn test_hammer_by_non_auctioneer_has_no_effect() {
        let mut a = open_auction();
        a.bid("a", 130.0, "");
        let before = a.clone();
        assert!(a.hammer("a", Some("a".into()), Some(1.0)).is_none());
        assert!(a.is_open());
        assert_eq!(a.current_price, before.current_price);
        assert_eq!(a.highest_bidder, before.highest_bidder);
    }

    #[test]
    fn test_hammer_defaults_to_highest_bid_and_closes() {
        let mut a = open_auction();
        a.bid("a", 130.0, "");
        let s = a.hammer("host", None, None).unwrap();
        assert_eq!(s.winner.as_deref(), Some("a"));
        assert_eq!(s.price, 130.0);
        assert!(!a.is_open());
        assert_eq!(a.bid("b", 999.0, ""), BidOutcome::Ignored);
        assert_eq!(s.hammer_line("阿A"), "🔨 [成交] 恭喜 阿A 以 130 拍得拍品！");
    }
}
