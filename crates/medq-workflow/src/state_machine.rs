//! 条目状态机
//!
//! 管理门诊与检查队列条目的状态转换

use medq_core::{EntryStatus, MedqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 条目状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntryEvent {
    Start,
    Complete,
    MarkNotAvailable,
    Reactivate,
}

/// 条目状态机
#[derive(Debug)]
pub struct EntryStateMachine {
    transitions: HashMap<(EntryStatus, EntryEvent), EntryStatus>,
}

impl EntryStateMachine {
    /// 门诊条目状态机
    pub fn opd() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((EntryStatus::Waiting, EntryEvent::Start), EntryStatus::InProgress);
        transitions.insert((EntryStatus::InProgress, EntryEvent::Complete), EntryStatus::Completed);
        transitions.insert(
            (EntryStatus::Waiting, EntryEvent::MarkNotAvailable),
            EntryStatus::NotAvailable,
        );
        transitions.insert((EntryStatus::NotAvailable, EntryEvent::Reactivate), EntryStatus::Waiting);

        Self { transitions }
    }

    /// 检查条目状态机，允许一步完成（仍需串行叫号校验）
    pub fn diagnostic() -> Self {
        let mut machine = Self::opd();
        machine
            .transitions
            .insert((EntryStatus::Waiting, EntryEvent::Complete), EntryStatus::Completed);
        machine
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: EntryStatus, event: EntryEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: EntryStatus, event: EntryEvent) -> Result<EntryStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(MedqError::InvalidStateTransition {
                from: from.as_str().to_string(),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current_state: EntryStatus) -> Vec<EntryEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current_state)
            .map(|(_, event)| *event)
            .collect()
    }
}
