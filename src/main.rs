//! ORPAR 演示程序
//!
//! 入口：初始化日志、加载配置，用脚本化后端启动一个控制循环，提交一条观察，
//! 等待一个完整周期后打印状态并停止。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use orpar::config::load_config;
use orpar::cycle::{
    BroadcastEventBus, ControlLoopRegistry, LoopDependencies, LoopEvent, Observation,
    ObservationSource,
};
use orpar::learning::RecordingLearner;
use orpar::llm::{ComplexityTier, ModelTable, ScriptedInference};
use orpar::memory::InMemoryPhaseMemory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    orpar::observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let events = Arc::new(BroadcastEventBus::new(cfg.app.event_capacity));
    let learner = Arc::new(RecordingLearner::new());
    let mut models = cfg.models.to_table();
    if models.is_empty() {
        // 未找到配置文件时的内置模型表
        models = ModelTable::new("scripted")
            .with_tier("scripted", ComplexityTier::Simple, "scripted-mini")
            .with_tier("scripted", ComplexityTier::Moderate, "scripted-pro")
            .with_tier("scripted", ComplexityTier::Complex, "scripted-max");
    }
    let deps = LoopDependencies::new(Arc::new(ScriptedInference::new()), models)
        .with_events(events.clone())
        .with_learner(learner.clone())
        .with_memory(Arc::new(InMemoryPhaseMemory::default()));
    let registry = ControlLoopRegistry::new(deps);

    // 事件打印
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let LoopEvent::PhaseTransition { from, to, .. } = &event {
                println!("  {from} -> {to}");
            }
        }
    });

    let loop_cfg = cfg.loop_config(&cfg.app.agent_id, &cfg.app.channel_id);
    let control_loop = registry.start(loop_cfg).await;
    let mut status_rx = control_loop.watch_status();

    control_loop
        .submit_observation(Observation::new(
            cfg.app.agent_id.clone(),
            ObservationSource::User,
            "Summarize the status of the deployment",
        ))
        .await
        .context("Failed to submit observation")?;

    tokio::time::timeout(
        Duration::from_secs(30),
        status_rx.wait_for(|s| s.cycle_count >= 1 || s.is_stopped()),
    )
    .await
    .context("Timed out waiting for the first cycle")?
    .context("Status channel closed")?;

    let status = control_loop.status();
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to serialize status")?
    );

    // 学习器在后台记录，稍等片刻
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("cycles recorded by learner: {}", learner.len());

    registry.shutdown().await;
    printer.abort();
    Ok(())
}
