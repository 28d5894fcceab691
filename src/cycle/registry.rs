//! 控制循环注册表：每个 (agent_id, channel_id) 至多一个存活的循环
//!
//! 注册表是显式注入的对象（`Arc<ControlLoopRegistry>`），不是全局单例。
//! 创建在写锁下先查后插；持有注册表锁时从不调用循环的方法。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::{CycleError, LoopKey, LoopStatus};
use crate::cycle::queue::SubmitOutcome;
use crate::cycle::scheduler::{ControlLoop, LoopConfig, LoopDependencies};
use crate::cycle::types::Observation;

pub struct ControlLoopRegistry {
    loops: RwLock<HashMap<LoopKey, Arc<ControlLoop>>>,
    deps: LoopDependencies,
}

impl ControlLoopRegistry {
    pub fn new(deps: LoopDependencies) -> Arc<Self> {
        Arc::new(Self {
            loops: RwLock::new(HashMap::new()),
            deps,
        })
    }

    pub fn dependencies(&self) -> &LoopDependencies {
        &self.deps
    }

    /// 取得或创建循环：已有存活实例时直接返回；已停止的旧条目被替换。
    /// 新建且 auto_run 时启动定时驱动。
    pub async fn start(self: &Arc<Self>, config: LoopConfig) -> Arc<ControlLoop> {
        let key = config.key();
        if let Some(existing) = self.live(&key).await {
            return existing;
        }

        let created = {
            let mut loops = self.loops.write().await;
            if let Some(existing) = loops.get(&key).filter(|l| !l.is_stopped()) {
                return existing.clone();
            }
            let control_loop = ControlLoop::new(config, self.deps.clone(), Arc::downgrade(self));
            loops.insert(key.clone(), control_loop.clone());
            control_loop
        };

        if created.config().auto_run {
            created.spawn_driver();
        }
        tracing::info!(key = %key, loop_id = %created.id(), "control loop registered");
        created
    }

    /// 严格创建：已有存活实例时返回 RegistryConflict
    pub async fn create(self: &Arc<Self>, config: LoopConfig) -> Result<Arc<ControlLoop>, CycleError> {
        let key = config.key();
        let created = {
            let mut loops = self.loops.write().await;
            if loops.get(&key).is_some_and(|l| !l.is_stopped()) {
                return Err(CycleError::RegistryConflict {
                    agent_id: key.agent_id,
                    channel_id: key.channel_id,
                });
            }
            let control_loop = ControlLoop::new(config, self.deps.clone(), Arc::downgrade(self));
            loops.insert(key.clone(), control_loop.clone());
            control_loop
        };

        if created.config().auto_run {
            created.spawn_driver();
        }
        Ok(created)
    }

    pub async fn get(&self, agent_id: &str, channel_id: &str) -> Option<Arc<ControlLoop>> {
        self.live(&LoopKey::new(agent_id, channel_id)).await
    }

    /// 向某个 Agent 在某频道的循环投递观察（跨 Agent 通信）
    pub async fn deliver(
        &self,
        agent_id: &str,
        channel_id: &str,
        observation: Observation,
    ) -> Result<SubmitOutcome, CycleError> {
        let Some(control_loop) = self.get(agent_id, channel_id).await else {
            return Err(CycleError::LoopNotFound {
                agent_id: agent_id.to_string(),
                channel_id: channel_id.to_string(),
            });
        };
        control_loop.submit_observation(observation).await
    }

    /// 停止单个循环；返回是否找到
    pub async fn stop(&self, agent_id: &str, channel_id: &str) -> bool {
        let found = self.loops.read().await.get(&LoopKey::new(agent_id, channel_id)).cloned();
        match found {
            Some(control_loop) => {
                control_loop.stop().await;
                true
            }
            None => false,
        }
    }

    /// 频道关闭：停止该频道上的全部循环，返回停止的数量
    pub async fn stop_channel(&self, channel_id: &str) -> usize {
        let targets: Vec<Arc<ControlLoop>> = self
            .loops
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.channel_id == channel_id)
            .map(|(_, l)| l.clone())
            .collect();
        for control_loop in &targets {
            control_loop.stop().await;
        }
        tracing::info!(channel_id, stopped = targets.len(), "channel loops stopped");
        targets.len()
    }

    /// 停止全部循环
    pub async fn shutdown(&self) -> usize {
        let targets: Vec<Arc<ControlLoop>> = self.loops.read().await.values().cloned().collect();
        for control_loop in &targets {
            control_loop.stop().await;
        }
        self.loops.write().await.clear();
        tracing::info!(stopped = targets.len(), "registry shut down");
        targets.len()
    }

    pub async fn statuses(&self) -> Vec<LoopStatus> {
        let mut out: Vec<LoopStatus> = self.loops.read().await.values().map(|l| l.status()).collect();
        out.sort_by(|a, b| (&a.agent_id, &a.channel_id).cmp(&(&b.agent_id, &b.channel_id)));
        out
    }

    pub async fn len(&self) -> usize {
        self.loops.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 循环停止后自行注销；只移除 ID 匹配的条目，避免误删替换后的新实例
    pub(crate) async fn deregister(&self, key: &LoopKey, loop_id: &str) {
        let mut loops = self.loops.write().await;
        if loops.get(key).is_some_and(|l| l.id() == loop_id) {
            loops.remove(key);
            tracing::debug!(key = %key, loop_id, "control loop deregistered");
        }
    }

    async fn live(&self, key: &LoopKey) -> Option<Arc<ControlLoop>> {
        self.loops
            .read()
            .await
            .get(key)
            .filter(|l| !l.is_stopped())
            .cloned()
    }
}
