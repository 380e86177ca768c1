//! Job lifecycle tests against scripted relays.
//!
//! Time is paused, so the default throttle delays elapse instantly.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::collections::BTreeSet;

use pretty_assertions::assert_eq;
use tokio::time::{Duration, Instant};
use volley_dispatch::{
    DispatchConfig, DispatchError, Event, JobState, RelayCredential, Severity, SubmitError,
    SubmitRequest, TransportError, config::ThrottleConfig,
};

use support::{Behaviour, Harness, ScriptedFactory, logs, outcomes, progress, recipients, relay, request};

#[tokio::test(start_paused = true)]
async fn test_single_relay_delivers_everything() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(5), vec![relay("smtp.one.test")], 1))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (5, 0, 0));

    let delivered = harness.factory.delivered();
    assert_eq!(
        delivered.iter().map(|m| m.to.clone()).collect::<Vec<_>>(),
        recipients(5)
    );
    for message in &delivered {
        assert_eq!(message.from, "sender@smtp.one.test");
        assert_eq!(message.sender_name, "Acme Mailer");
        assert_eq!(message.subject, "Hello");
    }

    let events = harness.drain();
    let outcomes = outcomes(&events);
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|(severity, _)| *severity == Severity::Success));

    let logs = logs(&events);
    assert!(logs[0].1.starts_with("Starting dispatch"));
    assert!(logs[0].1.ends_with("total 5"));
    assert!(
        logs.iter()
            .any(|(_, m)| m == "Sending 1/5 to user0@example.com via relay#1 (smtp.one.test) from sender@smtp.one.test")
    );
    assert_eq!(
        logs[logs.len() - 2],
        (Severity::Success, "Dispatch completed. Sent: 5, Failed: 0".to_string())
    );
    assert!(logs.last().unwrap().1.starts_with("Deliverability tips"));
}

#[tokio::test(start_paused = true)]
async fn test_failing_relay_exhausts_recipient() {
    let factory = ScriptedFactory::new().with(
        "smtp.down.test",
        Behaviour::Reject(TransportError::ConnectionRefused("refused".to_string())),
    );
    let mut harness = Harness::new(factory);

    let id = harness
        .dispatcher
        .submit(request(recipients(1), vec![relay("smtp.down.test")], 1))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Completed);
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (0, 1, 0));

    // Two attempts per relay in the pool
    assert_eq!(harness.factory.attempts_on("smtp.down.test"), 2);

    let events = harness.drain();
    let logs = logs(&events);
    assert!(logs.iter().any(|(severity, m)| *severity == Severity::Warning
        && m.contains("could not be reached up front")));
    assert!(logs.iter().any(|(_, m)| m.starts_with("[connection refused] relay#1 (smtp.down.test) failed for user0@example.com (attempt 1/2)")));
    assert!(logs.iter().any(|(_, m)| m.contains("(attempt 2/2)")));
    assert!(logs.iter().any(|(severity, m)| *severity == Severity::Error
        && m == "Giving up on user0@example.com after 2 attempts"));

    assert_eq!(outcomes(&events)[0].0, Severity::Error);
}

#[tokio::test(start_paused = true)]
async fn test_relay_disabled_exactly_once() {
    let factory = ScriptedFactory::new().with(
        "smtp.bad.test",
        Behaviour::Reject(TransportError::Permanent {
            code: 554,
            message: "rejected".to_string(),
        }),
    );
    let mut harness = Harness::new(factory);

    let id = harness
        .dispatcher
        .submit(request(
            recipients(10),
            vec![relay("smtp.bad.test"), relay("smtp.good.test")],
            1,
        ))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (10, 0, 0));
    assert_eq!(snapshot.active_relays, 1);

    // Once disabled the bad relay is skipped entirely
    assert_eq!(harness.factory.attempts_on("smtp.bad.test"), 3);
    assert_eq!(harness.factory.attempts_on("smtp.good.test"), 10);

    let events = harness.drain();
    let disabled: Vec<_> = logs(&events)
        .into_iter()
        .filter(|(_, m)| m.contains("disabled after"))
        .collect();
    assert_eq!(
        disabled,
        vec![(
            Severity::Warning,
            "relay#1 (smtp.bad.test) disabled after 3 failures".to_string()
        )]
    );

    let last = *progress(&events).last().unwrap();
    assert_eq!(last.active_relay_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_disabled_while_workers_queue_for_it() {
    let factory = ScriptedFactory::new().with(
        "smtp.bad.test",
        Behaviour::Reject(TransportError::ConnectionRefused("refused".to_string())),
    );
    let mut harness = Harness::new(factory);

    // Every worker queues for a slot on the one relay; most of them are
    // still waiting when it reaches the failure threshold.
    let id = harness
        .dispatcher
        .submit(request(recipients(10), vec![relay("smtp.bad.test")], 10))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (0, 10, 0));
    assert_eq!(snapshot.active_relays, 0);

    // Scripted sends finish at once, so none is in flight when it trips
    assert_eq!(harness.factory.attempts_on("smtp.bad.test"), 3);

    let disabled = logs(&harness.drain())
        .into_iter()
        .filter(|(_, m)| m.contains("disabled after"))
        .count();
    assert_eq!(disabled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_moves_to_next_relay() {
    let factory = ScriptedFactory::new().with("smtp.flaky.test", Behaviour::FailFirst(1));
    let harness = Harness::new(factory);

    let id = harness
        .dispatcher
        .submit(request(
            recipients(1),
            vec![relay("smtp.flaky.test"), relay("smtp.other.test")],
            1,
        ))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(snapshot.sent, 1);

    let attempts = harness.factory.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        (attempts[0].host.as_str(), attempts[0].accepted),
        ("smtp.flaky.test", false)
    );
    assert_eq!(
        (attempts[1].host.as_str(), attempts[1].accepted),
        ("smtp.other.test", true)
    );
    assert_eq!(attempts[1].message.from, "sender@smtp.other.test");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_recipient_is_never_attempted() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let recipients = vec![
        "not-an-address".to_string(),
        "ok@example.com".to_string(),
        "a..b@example.com".to_string(),
    ];

    let id = harness
        .dispatcher
        .submit(request(recipients, vec![relay("smtp.one.test")], 1))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (1, 2, 0));
    assert_eq!(harness.factory.attempts().len(), 1);

    let events = harness.drain();
    assert!(logs(&events).iter().any(|(severity, m)| *severity == Severity::Warning
        && m.starts_with("Skipping invalid recipient not-an-address")));
}

#[tokio::test(start_paused = true)]
async fn test_shards_cover_every_recipient_once() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(
            recipients(10),
            vec![relay("smtp.a.test"), relay("smtp.b.test")],
            3,
        ))
        .unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (10, 0, 0));

    let delivered: Vec<String> = harness.factory.delivered().into_iter().map(|m| m.to).collect();
    assert_eq!(delivered.len(), 10);
    assert_eq!(
        delivered.into_iter().collect::<BTreeSet<_>>(),
        recipients(10).into_iter().collect::<BTreeSet<_>>()
    );

    assert!(harness.factory.attempts_on("smtp.a.test") > 0);
    assert!(harness.factory.attempts_on("smtp.b.test") > 0);

    // One progress event per recipient, each one consistent
    let progress = progress(&harness.drain());
    assert_eq!(progress.len(), 10);
    for (i, p) in progress.iter().enumerate() {
        assert_eq!(p.total, 10);
        assert_eq!(p.sent + p.failed + p.remaining, p.total);
        assert_eq!(p.remaining, 10 - i - 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_pause_is_announced() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(12), vec![relay("smtp.one.test")], 1))
        .unwrap();

    harness.dispatcher.wait(id).await.unwrap();

    let pauses: Vec<String> = logs(&harness.drain())
        .into_iter()
        .filter(|(_, m)| m.contains("pausing"))
        .map(|(_, m)| m)
        .collect();
    assert_eq!(pauses, vec!["Worker 0 pausing 2000ms after 10 recipients"]);
}

fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_relay_interval_and_burst_pause_are_applied() {
    let harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(12), vec![relay("smtp.one.test")], 1))
        .unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    let times: Vec<Instant> = harness.factory.attempts().iter().map(|a| a.at).collect();
    assert_eq!(times.len(), 12);

    let gaps = gaps(&times);
    for (i, gap) in gaps.iter().enumerate() {
        assert!(*gap >= Duration::from_secs(1), "gap {i} was {gap:?}");
    }

    // The 11th recipient of the shard waits for the burst pause and its
    // own per-send delay; no other gap comes close
    assert!(gaps[9] >= Duration::from_millis(2200), "{:?}", gaps[9]);
    for (i, gap) in gaps.iter().enumerate().filter(|(i, _)| *i != 9) {
        assert!(*gap < Duration::from_secs(2), "gap {i} was {gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_relay_interval_holds_across_workers() {
    let harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(6), vec![relay("smtp.one.test")], 3))
        .unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    let mut times: Vec<Instant> = harness.factory.attempts().iter().map(|a| a.at).collect();
    times.sort();
    assert_eq!(times.len(), 6);
    for gap in gaps(&times) {
        assert!(gap >= Duration::from_secs(1), "{gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_per_send_delay_precedes_every_attempt() {
    let config = DispatchConfig {
        throttle: ThrottleConfig {
            base_delay_ms: 200,
            ..ThrottleConfig::disabled()
        },
        ..DispatchConfig::default()
    };
    let harness = Harness::with_config(ScriptedFactory::new(), config);

    let start = Instant::now();
    let id = harness
        .dispatcher
        .submit(request(recipients(5), vec![relay("smtp.one.test")], 1))
        .unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    let times: Vec<Instant> = harness.factory.attempts().iter().map(|a| a.at).collect();
    assert_eq!(times.len(), 5);
    assert!(times[0] - start >= Duration::from_millis(200));
    for gap in gaps(&times) {
        assert!(gap >= Duration::from_millis(200), "{gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_misaligned_relay_is_flagged() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let provider = RelayCredential {
        username: "news@acme.test".to_string(),
        ..relay("smtp.provider.test")
    };

    let id = harness
        .dispatcher
        .submit(request(recipients(2), vec![provider, relay("smtp.acme.test")], 1))
        .unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    let logs = logs(&harness.drain());
    assert!(logs.iter().any(|(severity, m)| *severity == Severity::Warning
        && m.starts_with("Ensure SPF/DKIM alignment")));

    let flagged: Vec<_> = logs
        .into_iter()
        .filter(|(_, m)| m.contains("sends as"))
        .collect();
    assert_eq!(
        flagged,
        vec![(
            Severity::Warning,
            "relay#1 (smtp.provider.test) sends as acme.test; SPF/DKIM for acme.test must cover this relay"
                .to_string()
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn test_placeholders_render_per_recipient() {
    let harness = Harness::new(ScriptedFactory::new());
    let request = SubmitRequest {
        subject: "Code {n:6}{nw:4} {n:6}{nw:4}".to_string(),
        html_body: "<p>{template}</p><a href=\"{link}\">x</a>".to_string(),
        template_catalog: vec!["alpha".to_string(), "beta".to_string()],
        link_catalog: vec!["https://l.test/1".to_string()],
        ..request(recipients(4), vec![relay("smtp.one.test")], 1)
    };

    let id = harness.dispatcher.submit(request).unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    let delivered = harness.factory.delivered();
    let subjects: BTreeSet<String> = delivered.iter().map(|m| m.subject.clone()).collect();
    assert_eq!(subjects.len(), 4);

    for message in &delivered {
        let (first, second) = message
            .subject
            .strip_prefix("Code ")
            .unwrap()
            .split_once(' ')
            .unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 10);
        assert!(first[..6].bytes().all(|b| b.is_ascii_digit()));
        assert_ne!(first, second);

        assert!(message.html.contains("https://l.test/1"));
        assert!(
            message.html.starts_with("<p>alpha</p>") || message.html.starts_with("<p>beta</p>")
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_empty_catalog_warns_once() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let request = SubmitRequest {
        html_body: "<p>{template}</p>".to_string(),
        ..request(recipients(3), vec![relay("smtp.one.test")], 1)
    };

    let id = harness.dispatcher.submit(request).unwrap();
    harness.dispatcher.wait(id).await.unwrap();

    assert!(
        harness
            .factory
            .delivered()
            .iter()
            .all(|m| m.html == "<p>{template}</p>")
    );

    let warnings = logs(&harness.drain())
        .into_iter()
        .filter(|(_, m)| m.starts_with("No catalog entries"))
        .count();
    assert_eq!(warnings, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_two_recipients() {
    let mut harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(10), vec![relay("smtp.one.test")], 1))
        .unwrap();

    loop {
        let event = harness.events.recv().await.unwrap();
        if let Event::Progress(p) = event.event
            && p.sent + p.failed == 2
        {
            break;
        }
    }
    harness.dispatcher.cancel(id).unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);
    assert_eq!(snapshot.sent + snapshot.failed, 2);
    assert_eq!(snapshot.remaining, 8);

    // Connections are torn down on cancel and again when the job ends
    let transports = harness.factory.transports();
    assert!(transports.iter().all(|t| t.close_count() >= 1));

    let logs = logs(&harness.drain());
    assert_eq!(
        logs.last().unwrap(),
        &(
            Severity::Warning,
            "Dispatch stopped by user. Sent: 2, Failed: 0, Not processed: 8".to_string()
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_in_flight_send() {
    let factory = ScriptedFactory::new().with("smtp.slow.test", Behaviour::HangUntilClosed);
    let mut harness = Harness::new(factory);

    let id = harness
        .dispatcher
        .submit(request(recipients(3), vec![relay("smtp.slow.test")], 1))
        .unwrap();

    loop {
        let event = harness.events.recv().await.unwrap();
        if let Event::Log(log) = event.event
            && log.message.starts_with("Sending 1/3")
        {
            break;
        }
    }
    harness.dispatcher.cancel(id).unwrap();

    let snapshot = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Aborted);
    assert_eq!((snapshot.sent, snapshot.failed, snapshot.remaining), (0, 0, 3));
    assert_eq!(snapshot.active_relays, 1);

    let events = harness.drain();
    assert!(outcomes(&events).is_empty());
    assert!(logs(&events).iter().any(|(severity, m)| *severity == Severity::Error
        && m.starts_with("Send to user0@example.com interrupted by stop request")));
}

#[tokio::test(start_paused = true)]
async fn test_job_registry() {
    let harness = Harness::new(ScriptedFactory::new());
    let id = harness
        .dispatcher
        .submit(request(recipients(2), vec![relay("smtp.one.test")], 1))
        .unwrap();

    assert_eq!(harness.dispatcher.status(id).unwrap().total, 2);
    assert_eq!(harness.dispatcher.jobs().len(), 1);

    let finished = harness.dispatcher.wait(id).await.unwrap();
    assert_eq!(harness.dispatcher.status(id).unwrap(), finished);
    assert_eq!(
        harness.dispatcher.cancel(id),
        Err(DispatchError::AlreadyFinished(id))
    );

    assert_eq!(harness.dispatcher.forget(id).unwrap(), finished);
    assert_eq!(
        harness.dispatcher.status(id),
        Err(DispatchError::UnknownJob(id))
    );
    assert_eq!(
        harness.dispatcher.cancel(id),
        Err(DispatchError::UnknownJob(id))
    );
    assert!(harness.dispatcher.jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_forget_running_job_is_refused() {
    let factory = ScriptedFactory::new().with("smtp.slow.test", Behaviour::HangUntilClosed);
    let harness = Harness::new(factory);

    let id = harness
        .dispatcher
        .submit(request(recipients(1), vec![relay("smtp.slow.test")], 1))
        .unwrap();

    assert_eq!(
        harness.dispatcher.forget(id),
        Err(DispatchError::StillRunning(id))
    );

    harness.dispatcher.cancel(id).unwrap();
    assert_eq!(
        harness.dispatcher.wait(id).await.unwrap().state,
        JobState::Aborted
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_request_starts_nothing() {
    let harness = Harness::new(ScriptedFactory::new());

    let result = harness
        .dispatcher
        .submit(request(Vec::new(), vec![relay("smtp.one.test")], 1));
    assert_eq!(result, Err(SubmitError::NoRecipients));

    let result = harness.dispatcher.submit(request(recipients(1), Vec::new(), 1));
    assert_eq!(result, Err(SubmitError::NoRelays));

    assert!(harness.dispatcher.jobs().is_empty());
    assert!(harness.factory.transports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_jobs_are_independent() {
    let factory = ScriptedFactory::new().with(
        "smtp.bad.test",
        Behaviour::Reject(TransportError::Timeout("DATA".to_string())),
    );
    let config = DispatchConfig {
        throttle: ThrottleConfig::disabled(),
        ..DispatchConfig::default()
    };
    let harness = Harness::with_config(factory, config);

    let failing = harness
        .dispatcher
        .submit(request(recipients(4), vec![relay("smtp.bad.test")], 2))
        .unwrap();
    let healthy = harness
        .dispatcher
        .submit(request(recipients(4), vec![relay("smtp.good.test")], 2))
        .unwrap();

    let failing = harness.dispatcher.wait(failing).await.unwrap();
    let healthy = harness.dispatcher.wait(healthy).await.unwrap();

    assert_eq!((failing.sent, failing.failed), (0, 4));
    assert_eq!(failing.active_relays, 0);
    assert_eq!((healthy.sent, healthy.failed), (4, 0));
    assert_eq!(healthy.active_relays, 1);
}
