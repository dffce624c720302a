//! Console printer
//!
//! Optional bus subscriber that mirrors captured traffic to stdout, for use
//! without the monitor UI.

use periscope_core::{Subscription, TrafficEvent};

/// How the console printer renders events
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PrintFormat {
    /// Do not print traffic
    None,
    /// One summary line per event
    Text,
    /// One JSON event per line, same shape as monitor frames
    Json,
}

/// Render one event, or `None` when nothing should be printed
pub fn format_event(event: &TrafficEvent, format: PrintFormat) -> Option<String> {
    match format {
        PrintFormat::None => None,
        PrintFormat::Json => event.to_json().ok(),
        PrintFormat::Text => Some(match event {
            TrafficEvent::Request(req) => format!(
                "[{}] → {} {} [{}]",
                format_timestamp(req.start),
                req.method,
                req.url,
                req.id
            ),
            TrafficEvent::Response(resp) => {
                let mut line = format!(
                    "[{}] ← {} {} ({} bytes{}) [{}]",
                    format_timestamp(resp.end),
                    resp.status_code,
                    resp.status_message,
                    resp.body.body_size,
                    if resp.body.truncated { ", truncated" } else { "" },
                    resp.id
                );
                if !resp.body.complete {
                    line.push_str(" incomplete");
                }
                line
            }
        }),
    }
}

/// Print events until the subscription ends
pub async fn print_events(mut subscription: Subscription, format: PrintFormat) {
    while let Some(event) = subscription.recv().await {
        if let Some(line) = format_event(&event, format) {
            println!("{line}");
        }
    }
}

/// Wall clock time of day (UTC) for a millisecond timestamp
fn format_timestamp(millis: u64) -> String {
    let secs = millis / 1000;
    let mins = secs / 60;
    let hours = mins / 60;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours % 24,
        mins % 60,
        secs % 60,
        millis % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::{
        BodyCollector, CapturedBody, CorrelationIdGenerator, RequestSnapshot, ResponseSnapshot,
        TrafficBus,
    };
    use std::sync::Arc;

    fn request() -> TrafficEvent {
        TrafficEvent::Request(RequestSnapshot {
            id: CorrelationIdGenerator::with_instance(0xabcd).next(),
            url: "/users/1?x=2".to_string(),
            method: "GET".to_string(),
            http_version: "1.1".to_string(),
            headers: vec![],
            body: CapturedBody::empty(),
            // 01:02:03.456 UTC
            start: 3_723_456,
            end: 3_723_456,
        })
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "00:00:00.000");
        assert_eq!(format_timestamp(3_723_456), "01:02:03.456");
        assert_eq!(format_timestamp(86_400_000 + 1), "00:00:00.001");
    }

    #[test]
    fn test_text_request_line() {
        let event = request();
        let line = format_event(&event, PrintFormat::Text).unwrap();
        assert!(line.starts_with("[01:02:03.456] → GET /users/1?x=2 ["));
        assert!(line.ends_with(&format!("[{}]", event.id())));
    }

    #[test]
    fn test_text_response_line() {
        let mut collector = BodyCollector::new(4);
        collector.push(b"hello world");
        let event = TrafficEvent::Response(ResponseSnapshot {
            id: CorrelationIdGenerator::new().next(),
            http_version: "1.1".to_string(),
            headers: vec![],
            status_code: 404,
            status_message: "Not Found".to_string(),
            body: collector.finish(),
            start: 0,
            end: 1,
        });
        let line = format_event(&event, PrintFormat::Text).unwrap();
        assert!(line.contains("← 404 Not Found (11 bytes, truncated)"));
    }

    #[test]
    fn test_json_and_none() {
        let event = request();
        assert!(format_event(&event, PrintFormat::None).is_none());

        let line = format_event(&event, PrintFormat::Json).unwrap();
        assert!(!line.contains('\n'));
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["url"], "/users/1?x=2");
    }

    #[tokio::test]
    async fn test_printer_stops_when_bus_closes() {
        let bus = Arc::new(TrafficBus::new(4));
        let sub = bus.subscribe().await;
        let printer = tokio::spawn(print_events(sub, PrintFormat::None));

        bus.publish(request()).await;
        bus.close().await;

        tokio::time::timeout(std::time::Duration::from_secs(5), printer)
            .await
            .unwrap()
            .unwrap();
    }
}
