//! Drive a live session over the mock transport.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tidal_sync_client::{
    DebugInfo, ManagerStats, MockChannelFactory, MockUpdateSource, OpenBehavior, RealtimeConfig,
    SubscriptionManager,
};
use tidal_sync_types::{ChangeKind, LiveMessage, Record, SessionId, Timestamp, TopicId};
use tokio::time::{sleep, Instant};

const DEMO_TOPIC: &str = "demo";

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct Options {
    /// Session to initialize.
    pub session: String,
    /// Opens that fail before the mock transport starts accepting.
    pub fail_opens: usize,
    /// How long to wait for a connection.
    pub duration: Duration,
}

/// What happened during a simulation.
#[derive(Debug)]
pub struct Report {
    /// Whether the channel came up before the deadline.
    pub connected: bool,
    /// Channel opens attempted.
    pub opens: usize,
    /// Manager counters at the end of the run.
    pub stats: ManagerStats,
    /// Manager state at the end of the run.
    pub info: DebugInfo,
}

/// Run the simulate command.
pub async fn run(realtime: RealtimeConfig, options: Options) -> Result<Report> {
    let factory = MockChannelFactory::new();
    let source = MockUpdateSource::new();
    source.set_topics([DEMO_TOPIC]);

    // Updates the poller should pick up while the channel is down.
    let later = Timestamp::now().saturating_add(Duration::from_secs(60));
    for (n, id) in ["poll-1", "poll-2"].into_iter().enumerate() {
        source.add_record(Record::new(
            id,
            DEMO_TOPIC,
            json!({ "seq": n }),
            later.saturating_add(Duration::from_millis(n as u64)),
        ));
    }

    if options.fail_opens > 0 {
        factory.set_open_behavior(OpenBehavior::Fail("simulated outage".into()));
    }

    let manager = SubscriptionManager::new(
        Arc::new(factory.clone()),
        Arc::new(source.clone()),
        realtime,
    );
    manager.add_status_listener(|state| println!("  status  -> {state}"));
    manager.add_message_listener(|msg| {
        println!(
            "  message {:?} {} on {}",
            msg.kind,
            msg.record.id,
            msg.topic()
        );
    });

    println!("=== simulate: session {} ===", options.session);
    println!();

    let status = manager.status_watch();
    manager.initialize(SessionId::new(options.session.clone()));

    let deadline = Instant::now() + options.duration;
    let connected = loop {
        if status.borrow().is_connected() {
            break true;
        }
        if factory.open_count() >= options.fail_opens {
            factory.set_open_behavior(OpenBehavior::Subscribe);
        }
        if Instant::now() >= deadline {
            break false;
        }
        sleep(Duration::from_millis(50)).await;
    };

    if connected {
        if let Some(channel) = factory.latest_channel() {
            channel.push_message(LiveMessage::new(
                ChangeKind::Update,
                Record::new("pushed-1", DEMO_TOPIC, json!({ "live": true }), Timestamp::now()),
            ));
        }
        sleep(Duration::from_millis(10)).await;

        let sent = manager
            .send(&TopicId::new(DEMO_TOPIC), "presence", json!({ "online": true }))
            .await;
        println!("  send presence: {}", if sent { "ok" } else { "dropped" });
    } else {
        println!("  gave up after {}s", options.duration.as_secs());
    }

    let report = Report {
        connected,
        opens: factory.open_count(),
        stats: manager.stats(),
        info: manager.debug_info(),
    };
    manager.destroy();

    println!();
    println!("Summary:");
    println!("  Final state:   {}", report.info.state);
    println!("  Opens:         {}", report.opens);
    println!("  Reconnects:    {}", report.stats.reconnect_attempts);
    println!("  Failures:      {}", report.stats.failures);
    if let Some(reason) = &report.info.last_failure {
        println!("  Last failure:  {reason}");
    }
    println!("  Pushed msgs:   {}", report.stats.messages_received);
    println!("  Polled msgs:   {}", report.stats.messages_polled);

    Ok(report)
}
