//! 端口分配
//!
//! 三类端口（代码执行 / 交互检查 / 应用预览）各占一段区间，区间按 slot 切成等宽小段。
//! 每个 (user, conversation) 占用一个 slot，三类端口都取该 slot 对应的小段，因此并发运行之间互不重叠。
//! 同一 key 可能同时被多个会话持有（被取代的旧运行尚未释放时），slot 在最后一个持有者释放后才归还。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub execution_base: u16,
    pub inspection_base: u16,
    pub app_base: u16,
    /// 每个 slot 每类端口的个数
    pub range_width: u16,
    pub max_slots: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            execution_base: 30000,
            inspection_base: 40000,
            app_base: 50000,
            range_width: 10,
            max_slots: 500,
        }
    }
}

/// 闭区间 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// docker `-p` 格式：`start-end`
    pub fn to_docker_spec(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub slot: u16,
    pub execution: PortRange,
    pub inspection: PortRange,
    pub app: PortRange,
}

impl PortAllocation {
    pub fn ranges(&self) -> [PortRange; 3] {
        [self.execution, self.inspection, self.app]
    }
}

#[derive(Debug)]
struct SlotLease {
    slot: u16,
    holders: HashSet<String>,
}

/// 进程内共享的端口分配器
#[derive(Debug)]
pub struct PortAllocator {
    settings: PortSettings,
    slots: Mutex<HashMap<String, SlotLease>>,
}

impl PortAllocator {
    /// 校验三段区间互不重叠且不越过 u16 上限
    pub fn new(settings: PortSettings) -> Result<Self, AgentError> {
        if settings.range_width == 0 || settings.max_slots == 0 {
            return Err(AgentError::Config(
                "port range_width and max_slots must be positive".to_string(),
            ));
        }
        let span = settings.range_width as u32 * settings.max_slots as u32;
        let mut regions = Vec::new();
        for base in [
            settings.execution_base,
            settings.inspection_base,
            settings.app_base,
        ] {
            let end = base as u32 + span - 1;
            if end > u16::MAX as u32 {
                return Err(AgentError::Config(format!(
                    "port region starting at {} exceeds 65535",
                    base
                )));
            }
            regions.push(PortRange {
                start: base,
                end: end as u16,
            });
        }
        for i in 0..regions.len() {
            for j in i + 1..regions.len() {
                if regions[i].overlaps(&regions[j]) {
                    return Err(AgentError::Config(format!(
                        "port regions overlap: {:?} and {:?}",
                        regions[i], regions[j]
                    )));
                }
            }
        }
        Ok(Self {
            settings,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// 同一 key 重复分配得到同一 slot，`holder` 记为该 slot 的持有者之一
    pub fn allocate(&self, key: &str, holder: &str) -> Result<PortAllocation, AgentError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| AgentError::RuntimeUnavailable("port allocator poisoned".to_string()))?;
        if let Some(lease) = slots.get_mut(key) {
            lease.holders.insert(holder.to_string());
            return Ok(self.allocation_for(lease.slot));
        }
        let slot = (0..self.settings.max_slots)
            .find(|s| !slots.values().any(|used| used.slot == *s))
            .ok_or_else(|| {
                AgentError::RuntimeUnavailable(format!(
                    "no free port slot ({} in use)",
                    slots.len()
                ))
            })?;
        slots.insert(
            key.to_string(),
            SlotLease {
                slot,
                holders: HashSet::from([holder.to_string()]),
            },
        );
        tracing::debug!(key = %key, slot, "port slot allocated");
        Ok(self.allocation_for(slot))
    }

    /// 移除 `holder`；返回 slot 是否因此归还（即它是最后一个持有者）。
    /// 非持有者调用不产生任何影响。
    pub fn release(&self, key: &str, holder: &str) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        let Some(lease) = slots.get_mut(key) else {
            return false;
        };
        if !lease.holders.remove(holder) {
            return false;
        }
        if !lease.holders.is_empty() {
            tracing::debug!(key = %key, slot = lease.slot, holders = lease.holders.len(), "port slot still held");
            return false;
        }
        if let Some(lease) = slots.remove(key) {
            tracing::debug!(key = %key, slot = lease.slot, "port slot released");
        }
        true
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn allocation_for(&self, slot: u16) -> PortAllocation {
        let w = self.settings.range_width;
        let range = |base: u16| PortRange {
            start: base + slot * w,
            end: base + slot * w + w - 1,
        };
        PortAllocation {
            slot,
            execution: range(self.settings.execution_base),
            inspection: range(self.settings.inspection_base),
            app: range(self.settings.app_base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> PortSettings {
        PortSettings {
            execution_base: 20000,
            inspection_base: 21000,
            app_base: 22000,
            range_width: 5,
            max_slots: 2,
        }
    }

    #[test]
    fn test_same_key_same_slot() {
        let alloc = PortAllocator::new(small()).unwrap();
        let a = alloc.allocate("u/c1", "r1").unwrap();
        let b = alloc.allocate("u/c1", "r1").unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.in_use(), 1);
    }

    #[test]
    fn test_distinct_keys_disjoint_ranges() {
        let alloc = PortAllocator::new(small()).unwrap();
        let a = alloc.allocate("u/c1", "r1").unwrap();
        let b = alloc.allocate("u/c2", "r2").unwrap();
        for ra in a.ranges() {
            for rb in b.ranges() {
                assert!(!ra.overlaps(&rb));
            }
        }
        assert_eq!(a.execution, PortRange { start: 20000, end: 20004 });
        assert_eq!(b.app, PortRange { start: 22005, end: 22009 });
    }

    #[test]
    fn test_exhaustion_and_release() {
        let alloc = PortAllocator::new(small()).unwrap();
        alloc.allocate("a", "r1").unwrap();
        alloc.allocate("b", "r2").unwrap();
        let err = alloc.allocate("c", "r3").unwrap_err();
        assert!(matches!(err, AgentError::RuntimeUnavailable(_)));
        assert!(alloc.release("a", "r1"));
        assert_eq!(alloc.allocate("c", "r3").unwrap().slot, 0);
    }

    #[test]
    fn test_slot_kept_until_last_holder_releases() {
        let alloc = PortAllocator::new(small()).unwrap();
        let old = alloc.allocate("u/c1", "old-run").unwrap();
        let new = alloc.allocate("u/c1", "new-run").unwrap();
        assert_eq!(old, new);

        // 被取代的旧运行先释放：新运行仍持有该 slot
        assert!(!alloc.release("u/c1", "old-run"));
        assert_eq!(alloc.in_use(), 1);
        let other = alloc.allocate("u/c2", "r3").unwrap();
        for ra in new.ranges() {
            for rb in other.ranges() {
                assert!(!ra.overlaps(&rb));
            }
        }

        // 重复释放与非持有者释放都无效
        assert!(!alloc.release("u/c1", "old-run"));
        assert!(!alloc.release("u/c1", "stranger"));
        assert!(alloc.release("u/c1", "new-run"));
        assert_eq!(alloc.in_use(), 1);
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let mut s = small();
        s.inspection_base = 20003;
        assert!(matches!(
            PortAllocator::new(s),
            Err(AgentError::Config(_))
        ));
    }
}
