#[cfg(test)]
mod tests {
    use aqe_core::*;
    use uuid::Uuid;

    // ── AgentType tests ────────────────────────────────────────

    #[test]
    fn test_agent_type_accepts_plain_ids() {
        let at = AgentType::new("test-generator").unwrap();
        assert_eq!(at.as_str(), "test-generator");
        assert_eq!(at.to_string(), "test-generator");
        assert!(AgentType::new("coverage_analyzer.v2").is_ok());
    }

    #[test]
    fn test_agent_type_rejects_empty_and_invalid() {
        assert!(AgentType::new("").unwrap_err().is_validation());
        assert!(AgentType::new("has space").unwrap_err().is_validation());
        assert!(AgentType::new("slash/agent").unwrap_err().is_validation());
        assert!(AgentType::new("x".repeat(MAX_AGENT_TYPE_LEN + 1)).is_err());
    }

    #[test]
    fn test_agent_type_serde_validates() {
        let at: AgentType = serde_json::from_str("\"quality-gate\"").unwrap();
        assert_eq!(at.as_str(), "quality-gate");
        assert!(serde_json::from_str::<AgentType>("\"bad agent\"").is_err());
        assert_eq!(serde_json::to_string(&at).unwrap(), "\"quality-gate\"");
    }

    #[test]
    fn test_session_open_state() {
        let mut session = Session {
            session_id: Uuid::new_v4(),
            agent_type: AgentType::new("gen").unwrap(),
            episode: 1,
            started_at: chrono::Utc::now(),
            ended_at: None,
        };
        assert!(session.is_open());
        session.ended_at = Some(chrono::Utc::now());
        assert!(!session.is_open());
    }

    #[test]
    fn test_millis_conversion() {
        let ms = now_millis();
        let dt = datetime_from_millis(ms);
        assert_eq!(dt.timestamp_millis(), ms);
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_display_carries_context() {
        let err = AqeError::ConnectionTimeout {
            operation: "q_table.upsert".into(),
            waited_ms: 5000,
        };
        let s = err.to_string();
        assert!(s.contains("q_table.upsert"));
        assert!(s.contains("5000"));
    }

    #[test]
    fn test_error_transience() {
        let timeout = AqeError::ConnectionTimeout {
            operation: "x".into(),
            waited_ms: 1,
        };
        let reset = AqeError::Connection {
            operation: "x".into(),
            reason: "reset".into(),
        };
        assert!(timeout.is_transient());
        assert!(reset.is_transient());
        assert!(!AqeError::validation("key", "bad").is_transient());
        assert!(!AqeError::constraint("session", "closed twice").is_transient());
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AqeError = serde_err.into();
        assert!(err.to_string().starts_with("serialization error"));
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::MemoryStored { key: "aqe/a/b".into() });
        match rx.recv().await.unwrap() {
            Event::MemoryStored { key } => assert_eq!(key, "aqe/a/b"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(Event::MemoryReaped { count: 3 });
        // Late subscribers only see events published after they joined
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serde_tagged() {
        let ev = Event::ValueUpdated {
            agent_type: "gen".into(),
            state_key: "complexity=low".into(),
            action: "unit".into(),
            value: 0.5,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "value_updated");
        assert_eq!(json["action"], "unit");
    }
}
