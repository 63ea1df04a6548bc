#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use aqe_config::LearningConfig;
    use aqe_core::{AgentType, AqeError, Event, EventBus};
    use aqe_learning::*;
    use aqe_memory::ConnectionManager;
    use parking_lot::Mutex;
    use serde_json::json;

    async fn open_db(dir: &tempfile::TempDir) -> ConnectionManager {
        let path = dir.path().join("learning.db");
        ConnectionManager::connect(&format!("sqlite://{}", path.display()), 1, 4)
            .await
            .unwrap()
    }

    fn agent(name: &str) -> AgentType {
        AgentType::new(name).unwrap()
    }

    fn actions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn state(raw: &str) -> StateKey {
        StateKey::from_raw(raw)
    }

    /// Sampler replaying scripted draws, then falling back to "no explore, index 0".
    #[derive(Default)]
    struct ScriptedSampler {
        units: Mutex<VecDeque<f64>>,
        indices: Mutex<VecDeque<usize>>,
    }

    impl ScriptedSampler {
        fn new(units: &[f64], indices: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                units: Mutex::new(units.iter().copied().collect()),
                indices: Mutex::new(indices.iter().copied().collect()),
            })
        }
    }

    impl Sampler for ScriptedSampler {
        fn unit(&self) -> f64 {
            self.units.lock().pop_front().unwrap_or(0.999)
        }

        fn index(&self, len: usize) -> usize {
            self.indices.lock().pop_front().unwrap_or(0) % len
        }
    }

    // ── Q-table store ──────────────────────────────────────────

    mod q_table {
        use super::*;

        #[tokio::test]
        async fn test_get_absent_then_upsert() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let (a, s) = (agent("test-gen"), state("complexity=low"));

            assert!(store.get(&a, &s, "unit").await.unwrap().is_none());
            assert_eq!(store.upsert(&a, &s, "unit", 0.4).await.unwrap(), 1);
            assert_eq!(store.upsert(&a, &s, "unit", 0.7).await.unwrap(), 2);

            let q = store.get(&a, &s, "unit").await.unwrap().unwrap();
            assert_eq!(q.value, 0.7);
            assert_eq!(q.visits, 2);
            assert_eq!(q.agent_type, a);
        }

        #[tokio::test]
        async fn test_upsert_rejects_non_finite() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let err = store
                .upsert(&agent("a"), &state("s"), "x", f64::NAN)
                .await
                .unwrap_err();
            assert!(err.is_validation());
        }

        #[tokio::test]
        async fn test_best_action_breaks_ties_by_candidate_order() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let (a, s) = (agent("test-gen"), state("s"));
            store.upsert(&a, &s, "a", 0.5).await.unwrap();
            store.upsert(&a, &s, "b", 0.9).await.unwrap();
            store.upsert(&a, &s, "c", 0.9).await.unwrap();

            let best = store.best_action(&a, &s, &actions(&["a", "c", "b"])).await.unwrap();
            assert_eq!(best, Some(("c".to_string(), 0.9)));
            let best = store.best_action(&a, &s, &actions(&["b", "c"])).await.unwrap();
            assert_eq!(best, Some(("b".to_string(), 0.9)));
            // values outside the candidate list are ignored
            let best = store.best_action(&a, &s, &actions(&["a", "z"])).await.unwrap();
            assert_eq!(best, Some(("a".to_string(), 0.5)));
            assert!(store.best_action(&a, &s, &actions(&["z"])).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_values_are_scoped_by_agent_type() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let s = state("s");
            store.upsert(&agent("gen"), &s, "a", 1.0).await.unwrap();
            assert!(store.get(&agent("cov"), &s, "a").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_apply_update_first_visit() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let a = agent("gen");
            let update = store
                .apply_update(&a, &state("s0"), "x", 1.0, &state("s1"), &actions(&["x"]), 0.5, 0.9)
                .await
                .unwrap();
            assert_eq!(update.old_value, None);
            assert_eq!(update.max_next, 0.0);
            assert_eq!(update.target, 1.0);
            assert_eq!(update.new_value, 0.5);
            assert_eq!(update.visits, 1);
        }

        #[tokio::test]
        async fn test_apply_update_bootstraps_from_next_state() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let a = agent("gen");
            let (s0, s1) = (state("s0"), state("s1"));
            store.upsert(&a, &s0, "x", 0.2).await.unwrap();
            store.upsert(&a, &s1, "y", 2.0).await.unwrap();
            store.upsert(&a, &s1, "z", 3.0).await.unwrap();

            let update = store
                .apply_update(&a, &s0, "x", 0.5, &s1, &actions(&["y", "z"]), 0.1, 0.9)
                .await
                .unwrap();
            let target = 0.5 + 0.9 * 3.0;
            assert_eq!(update.old_value, Some(0.2));
            assert!((update.new_value - (0.2 + 0.1 * (target - 0.2))).abs() < 1e-12);
            let stored = store.get(&a, &s0, "x").await.unwrap().unwrap();
            assert!((stored.value - update.new_value).abs() < 1e-12);
        }

        #[tokio::test]
        async fn test_apply_update_validates_parameters() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let (a, s) = (agent("gen"), state("s"));
            for (alpha, gamma) in [(0.0, 0.9), (1.5, 0.9), (0.1, -0.1), (0.1, 1.1)] {
                let err = store
                    .apply_update(&a, &s, "x", 1.0, &s, &[], alpha, gamma)
                    .await
                    .unwrap_err();
                assert!(err.is_validation());
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_updates_converge() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let (alpha, gamma, reward, n) = (0.1, 0.9, 1.0, 24);

            let mut handles = Vec::new();
            for _ in 0..n {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store
                        .apply_update(
                            &agent("gen"),
                            &state("s0"),
                            "x",
                            reward,
                            &state("terminal"),
                            &[],
                            alpha,
                            gamma,
                        )
                        .await
                }));
            }
            for h in handles {
                h.await.unwrap().unwrap();
            }

            // Sequential application: v_k = v_{k-1} + α(r − v_{k-1})
            let expected = (0..n).fold(0.0, |v, _| v + alpha * (reward - v));
            let q = store.get(&agent("gen"), &state("s0"), "x").await.unwrap().unwrap();
            assert_eq!(q.visits, n as u64);
            assert!((q.value - expected).abs() < 1e-9, "{} vs {expected}", q.value);
        }

        #[tokio::test]
        async fn test_entries_and_reset() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let (gen_agent, cov) = (agent("gen"), agent("cov"));
            store.upsert(&gen_agent, &state("b"), "x", 1.0).await.unwrap();
            store.upsert(&gen_agent, &state("a"), "y", 2.0).await.unwrap();
            store.upsert(&cov, &state("a"), "y", 3.0).await.unwrap();

            let entries = store.entries(&gen_agent).await.unwrap();
            let keys: Vec<_> = entries.iter().map(|q| q.state_key.as_str()).collect();
            assert_eq!(keys, vec!["a", "b"]);

            assert_eq!(store.reset(&gen_agent).await.unwrap(), 2);
            assert!(store.entries(&gen_agent).await.unwrap().is_empty());
            assert_eq!(store.entries(&cov).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_refresh_patterns_picks_best_visited_action() {
            let dir = tempfile::tempdir().unwrap();
            let store = QTableStore::new(open_db(&dir).await);
            let a = agent("gen");
            let s = state("s");
            for _ in 0..3 {
                store.upsert(&a, &s, "x", 0.5).await.unwrap();
            }
            store.upsert(&a, &s, "y", 0.9).await.unwrap();
            store.upsert(&a, &state("rare"), "z", 1.0).await.unwrap();

            // y has a single visit, below the threshold
            assert_eq!(store.refresh_patterns(&a, 2).await.unwrap(), 1);
            let patterns = store.patterns(&a).await.unwrap();
            assert_eq!(patterns.len(), 1);
            assert_eq!(patterns[0].action, "x");
            assert_eq!(patterns[0].support, 4);
            assert!((patterns[0].confidence - 0.75).abs() < 1e-12);

            assert_eq!(store.refresh_patterns(&a, 1).await.unwrap(), 2);
            let patterns = store.patterns(&a).await.unwrap();
            assert_eq!(patterns.iter().find(|p| p.state_key == "s").unwrap().action, "y");
        }
    }

    // ── Sessions ───────────────────────────────────────────────

    mod session {
        use super::*;

        #[tokio::test]
        async fn test_register_agent_type_is_idempotent() {
            let dir = tempfile::tempdir().unwrap();
            let sessions = SessionManager::new(open_db(&dir).await);
            let first = sessions
                .register_agent_type(&agent("test-gen"), "Test Generator")
                .await
                .unwrap();
            let again = sessions
                .register_agent_type(&agent("test-gen"), "Renamed")
                .await
                .unwrap();
            assert_eq!(again.name, "Test Generator");
            assert_eq!(again.created_at, first.created_at);
            assert_eq!(sessions.agent_types().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_open_assigns_episode_numbers_per_agent() {
            let dir = tempfile::tempdir().unwrap();
            let sessions = SessionManager::new(open_db(&dir).await);
            let s1 = sessions.open_session(&agent("gen")).await.unwrap();
            let s2 = sessions.open_session(&agent("gen")).await.unwrap();
            let other = sessions.open_session(&agent("cov")).await.unwrap();
            assert_eq!((s1.episode, s2.episode, other.episode), (1, 2, 1));
            assert!(s1.is_open());

            let listed = sessions.sessions_for_agent(&agent("gen")).await.unwrap();
            let ids: Vec<_> = listed.iter().map(|s| s.session_id).collect();
            assert_eq!(ids, vec![s1.session_id, s2.session_id]);
            // opening registers the agent type
            assert_eq!(sessions.agent_types().await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_double_close_is_constraint_violation() {
            let dir = tempfile::tempdir().unwrap();
            let sessions = SessionManager::new(open_db(&dir).await);
            let s = sessions.open_session(&agent("gen")).await.unwrap();

            let closed = sessions.close_session(s.session_id).await.unwrap();
            assert!(!closed.is_open());
            let err = sessions.close_session(s.session_id).await.unwrap_err();
            assert!(matches!(err, AqeError::ConstraintViolation { .. }), "{err}");

            let fetched = sessions.get_session(s.session_id).await.unwrap().unwrap();
            assert_eq!(fetched.ended_at, closed.ended_at);
        }

        #[tokio::test]
        async fn test_close_unknown_session_is_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let sessions = SessionManager::new(open_db(&dir).await);
            let err = sessions.close_session(uuid::Uuid::new_v4()).await.unwrap_err();
            assert!(matches!(err, AqeError::NotFound { .. }));
            assert!(sessions.get_session(uuid::Uuid::new_v4()).await.unwrap().is_none());
        }

        #[tokio::test]
        async fn test_agent_state_roundtrip() {
            let dir = tempfile::tempdir().unwrap();
            let sessions = SessionManager::new(open_db(&dir).await);
            let a = agent("gen");
            assert!(sessions.load_agent_state(&a).await.unwrap().is_none());
            sessions.save_agent_state(&a, &json!({"episodes": 3})).await.unwrap();
            sessions.save_agent_state(&a, &json!({"episodes": 4})).await.unwrap();
            assert_eq!(sessions.load_agent_state(&a).await.unwrap(), Some(json!({"episodes": 4})));
        }

        #[tokio::test]
        async fn test_lifecycle_events_are_published() {
            let dir = tempfile::tempdir().unwrap();
            let bus = EventBus::new(16);
            let mut rx = bus.subscribe();
            let sessions = SessionManager::new(open_db(&dir).await).with_events(bus);
            let s = sessions.open_session(&agent("gen")).await.unwrap();
            sessions.close_session(s.session_id).await.unwrap();

            assert!(matches!(rx.recv().await.unwrap(), Event::SessionOpened { episode: 1, .. }));
            assert!(matches!(rx.recv().await.unwrap(), Event::SessionClosed { .. }));
        }
    }

    // ── Trajectory recorder ────────────────────────────────────

    mod trajectory {
        use super::*;
        use futures::TryStreamExt;

        async fn setup(dir: &tempfile::TempDir) -> (TrajectoryRecorder, SessionManager) {
            let db = open_db(dir).await;
            (TrajectoryRecorder::new(db.clone()), SessionManager::new(db))
        }

        #[tokio::test]
        async fn test_sequential_appends_have_no_gaps() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s = sessions.open_session(&agent("gen")).await.unwrap();

            for i in 0..5u64 {
                let idx = recorder
                    .append(s.session_id, &state("a"), "x", i as f64, &state("b"))
                    .await
                    .unwrap();
                assert_eq!(idx, i);
            }
            let replay = recorder.replay(s.session_id).await.unwrap();
            let indices: Vec<u64> = replay.iter().map(|t| t.seq_index).collect();
            assert_eq!(indices, vec![0, 1, 2, 3, 4]);
            assert_eq!(replay[3].reward, 3.0);
            assert_eq!(replay[0].next_state_key, "b");
            assert_eq!(recorder.len(s.session_id).await.unwrap(), 5);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_appends_have_no_gaps() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s = sessions.open_session(&agent("gen")).await.unwrap();

            let mut handles = Vec::new();
            for i in 0..30 {
                let recorder = recorder.clone();
                let id = s.session_id;
                handles.push(tokio::spawn(async move {
                    recorder.append(id, &state("a"), "x", i as f64, &state("b")).await
                }));
            }
            let mut assigned = Vec::new();
            for h in handles {
                assigned.push(h.await.unwrap().unwrap());
            }
            assigned.sort();
            assert_eq!(assigned, (0..30).collect::<Vec<u64>>());

            let replay = recorder.replay(s.session_id).await.unwrap();
            assert!(replay.windows(2).all(|w| w[0].seq_index + 1 == w[1].seq_index));
        }

        #[tokio::test]
        async fn test_sessions_have_independent_sequences() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s1 = sessions.open_session(&agent("gen")).await.unwrap();
            let s2 = sessions.open_session(&agent("gen")).await.unwrap();
            recorder.append(s1.session_id, &state("a"), "x", 0.0, &state("b")).await.unwrap();
            let idx = recorder
                .append(s2.session_id, &state("a"), "x", 0.0, &state("b"))
                .await
                .unwrap();
            assert_eq!(idx, 0);
        }

        #[tokio::test]
        async fn test_append_rejects_closed_and_unknown_sessions() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s = sessions.open_session(&agent("gen")).await.unwrap();
            sessions.close_session(s.session_id).await.unwrap();

            let err = recorder
                .append(s.session_id, &state("a"), "x", 1.0, &state("b"))
                .await
                .unwrap_err();
            assert!(matches!(err, AqeError::ConstraintViolation { .. }));

            let err = recorder
                .append(uuid::Uuid::new_v4(), &state("a"), "x", 1.0, &state("b"))
                .await
                .unwrap_err();
            assert!(matches!(err, AqeError::ConstraintViolation { .. }));
            assert_eq!(recorder.len(s.session_id).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_replay_pages_and_streams() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s = sessions.open_session(&agent("gen")).await.unwrap();
            for i in 0..25 {
                recorder
                    .append(s.session_id, &state("a"), "x", i as f64, &state("b"))
                    .await
                    .unwrap();
            }

            let first = recorder.replay_page(s.session_id, None, 10).await.unwrap();
            assert_eq!(first.len(), 10);
            let second = recorder.replay_page(s.session_id, Some(9), 10).await.unwrap();
            assert_eq!(second[0].seq_index, 10);

            let streamed: Vec<_> = recorder
                .replay_stream(s.session_id, 7)
                .try_collect()
                .await
                .unwrap();
            assert_eq!(streamed, recorder.replay(s.session_id).await.unwrap());
        }

        #[tokio::test]
        async fn test_stream_of_exact_page_multiple_terminates() {
            let dir = tempfile::tempdir().unwrap();
            let (recorder, sessions) = setup(&dir).await;
            let s = sessions.open_session(&agent("gen")).await.unwrap();
            for _ in 0..4 {
                recorder.append(s.session_id, &state("a"), "x", 0.0, &state("b")).await.unwrap();
            }
            let streamed: Vec<_> = recorder
                .replay_stream(s.session_id, 2)
                .try_collect()
                .await
                .unwrap();
            assert_eq!(streamed.len(), 4);
        }
    }

    // ── Q-learner ──────────────────────────────────────────────

    mod learner {
        use super::*;

        async fn setup(
            dir: &tempfile::TempDir,
            sampler: Arc<dyn Sampler>,
        ) -> (QLearner, SessionManager, ConnectionManager) {
            let db = open_db(dir).await;
            let learner =
                QLearner::new(db.clone(), &LearningConfig::default()).with_sampler(sampler);
            (learner, SessionManager::new(db.clone()), db)
        }

        fn rates() -> LearningRates {
            LearningRates::new(0.5, 0.9).unwrap()
        }

        #[tokio::test]
        async fn test_greedy_choice_returns_maximum() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, _, _) = setup(&dir, ScriptedSampler::new(&[], &[])).await;
            let a = agent("gen");
            let ctx = json!({"complexity": 3});
            let s = learner.encode(&ctx);
            learner.q_table().upsert(&a, &s, "unit", 0.2).await.unwrap();
            learner.q_table().upsert(&a, &s, "property", 0.8).await.unwrap();
            learner.q_table().upsert(&a, &s, "fuzz", 0.8).await.unwrap();

            let candidates = actions(&["unit", "fuzz", "property"]);
            for _ in 0..10 {
                let choice = learner.choose_action(&a, &ctx, &candidates, 0.0).await.unwrap();
                assert_eq!(choice.policy, Policy::Exploit);
                assert_eq!(choice.action, "fuzz");
                assert_eq!(choice.value, Some(0.8));
                assert_eq!(choice.state, s);
            }
        }

        #[tokio::test]
        async fn test_cold_start_falls_back_to_random_candidate() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, _, _) = setup(&dir, ScriptedSampler::new(&[], &[2])).await;
            let choice = learner
                .choose_action(&agent("gen"), &json!({}), &actions(&["a", "b", "c"]), 0.0)
                .await
                .unwrap();
            assert_eq!(choice.policy, Policy::ColdStart);
            assert_eq!(choice.action, "c");
            assert_eq!(choice.value, None);
        }

        #[tokio::test]
        async fn test_exploration_draws_uniformly() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, _, _) = setup(&dir, ScriptedSampler::new(&[0.05, 0.5], &[1])).await;
            let a = agent("gen");
            let s = learner.encode(&json!({}));
            learner.q_table().upsert(&a, &s, "a", 1.0).await.unwrap();
            let candidates = actions(&["a", "b"]);

            let explored = learner.choose_action(&a, &json!({}), &candidates, 0.1).await.unwrap();
            assert_eq!(explored.policy, Policy::Explore);
            assert_eq!(explored.action, "b");

            let exploited = learner.choose_action(&a, &json!({}), &candidates, 0.1).await.unwrap();
            assert_eq!(exploited.policy, Policy::Exploit);
            assert_eq!(exploited.action, "a");
        }

        #[tokio::test]
        async fn test_invalid_selection_input_is_validation_error() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, _, _) = setup(&dir, Arc::new(ThreadSampler)).await;
            let a = agent("gen");
            let no_candidates = learner.choose_action(&a, &json!({}), &[], 0.1).await;
            assert!(no_candidates.unwrap_err().is_validation());
            let bad_epsilon = learner
                .choose_action(&a, &json!({}), &actions(&["x"]), 1.5)
                .await;
            assert!(bad_epsilon.unwrap_err().is_validation());
        }

        #[tokio::test]
        async fn test_update_learns_and_records_trajectory() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, _) = setup(&dir, Arc::new(ThreadSampler)).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();

            let experience = Experience {
                session_id: session.session_id,
                state: state("s0"),
                action: "unit".into(),
                reward: 1.0,
                next_state: state("s1"),
                next_actions: actions(&["unit"]),
            };
            let outcome = learner.update(&a, &experience, rates()).await;
            let learned = outcome.learned().unwrap();
            assert_eq!(learned.update.new_value, 0.5);
            assert_eq!(learned.trajectory, TrajectoryStatus::Recorded(0));
            assert!(outcome.warning().is_none());

            let second = learner.update(&a, &experience, rates()).await;
            assert_eq!(second.learned().unwrap().trajectory, TrajectoryStatus::Recorded(1));
            assert!((second.learned().unwrap().update.new_value - 0.75).abs() < 1e-12);
        }

        #[tokio::test]
        async fn test_trajectory_failure_keeps_value_update() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, _) = setup(&dir, Arc::new(ThreadSampler)).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();
            sessions.close_session(session.session_id).await.unwrap();

            let experience = Experience {
                session_id: session.session_id,
                state: state("s0"),
                action: "unit".into(),
                reward: 1.0,
                next_state: state("s1"),
                next_actions: vec![],
            };
            let outcome = learner.update(&a, &experience, rates()).await;
            assert!(outcome.is_learned());
            assert!(outcome.warning().unwrap().contains("trajectory"));

            let stored = learner.q_table().get(&a, &state("s0"), "unit").await.unwrap().unwrap();
            assert_eq!(stored.value, 0.5);
        }

        #[tokio::test]
        async fn test_invalid_rates_are_skipped_not_raised() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, _) = setup(&dir, Arc::new(ThreadSampler)).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();
            let experience = Experience {
                session_id: session.session_id,
                state: state("s0"),
                action: "unit".into(),
                reward: 1.0,
                next_state: state("s1"),
                next_actions: vec![],
            };
            let outcome = learner
                .update(&a, &experience, LearningRates { alpha: 0.0, gamma: 0.9 })
                .await;
            assert!(matches!(outcome, LearnOutcome::Skipped(SkipReason::InvalidInput(_))));
        }

        #[tokio::test]
        async fn test_store_outage_degrades_gracefully() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, db) = setup(&dir, ScriptedSampler::new(&[], &[1])).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();
            db.disconnect();

            let choice = learner
                .choose_action(&a, &json!({}), &actions(&["a", "b"]), 0.0)
                .await
                .unwrap();
            assert_eq!(choice.policy, Policy::Degraded);
            assert_eq!(choice.action, "b");

            let experience = Experience {
                session_id: session.session_id,
                state: choice.state.clone(),
                action: choice.action.clone(),
                reward: 1.0,
                next_state: state("s1"),
                next_actions: vec![],
            };
            let outcome = learner.update(&a, &experience, rates()).await;
            assert!(matches!(outcome, LearnOutcome::Skipped(SkipReason::StoreUnavailable(_))));
        }

        #[tokio::test]
        async fn test_observe_outcome_rewards_and_learns() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, db) = setup(&dir, Arc::new(ThreadSampler)).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();
            let ctx = json!({"complexity": 25, "coverage": 40});

            let choice = learner
                .choose_action(&a, &ctx, &actions(&["unit", "property"]), 0.0)
                .await
                .unwrap();
            let outcome = TaskOutcome {
                success: true,
                coverage_before: Some(40.0),
                coverage_after: Some(65.0),
                ..Default::default()
            };
            let observation = learner
                .observe_outcome(
                    &a,
                    session.session_id,
                    &choice,
                    &outcome,
                    &json!({"complexity": 25, "coverage": 65}),
                    &actions(&["unit", "property"]),
                    rates(),
                )
                .await;

            // 1.0·1.5 difficulty + 2.0·25/100
            assert!((observation.reward.total - 2.0).abs() < 1e-12);
            let learned = observation.outcome.learned().unwrap();
            assert!((learned.update.new_value - 1.0).abs() < 1e-12);
            assert_ne!(observation.next_state, choice.state);

            let rows = db.fetch("SELECT reward FROM rewards", vec![]).await.unwrap();
            assert_eq!(rows.len(), 1);
        }

        #[tokio::test]
        async fn test_learner_publishes_events() {
            let dir = tempfile::tempdir().unwrap();
            let db = open_db(&dir).await;
            let bus = EventBus::new(32);
            let mut rx = bus.subscribe();
            let learner = QLearner::new(db.clone(), &LearningConfig::default()).with_events(bus);
            let a = agent("gen");
            let session = SessionManager::new(db).open_session(&a).await.unwrap();

            learner
                .choose_action(&a, &json!({}), &actions(&["x"]), 0.0)
                .await
                .unwrap();
            let experience = Experience {
                session_id: session.session_id,
                state: state("s0"),
                action: "x".into(),
                reward: 1.0,
                next_state: state("s1"),
                next_actions: vec![],
            };
            learner.update(&a, &experience, rates()).await;

            assert!(matches!(rx.recv().await.unwrap(), Event::ActionChosen { .. }));
            assert!(matches!(rx.recv().await.unwrap(), Event::ValueUpdated { .. }));
            assert!(matches!(
                rx.recv().await.unwrap(),
                Event::TrajectoryAppended { seq_index: 0, .. }
            ));
        }

        #[tokio::test]
        async fn test_repeated_success_makes_action_preferred() {
            let dir = tempfile::tempdir().unwrap();
            let (learner, sessions, _) = setup(&dir, ScriptedSampler::new(&[], &[])).await;
            let a = agent("gen");
            let session = sessions.open_session(&a).await.unwrap();
            let ctx = json!({"complexity": 8, "task_type": "test_generation"});
            let candidates = actions(&["unit", "integration"]);
            let s = learner.encode(&ctx);

            for (action, reward) in [("unit", -1.0), ("integration", 1.0), ("integration", 1.0)] {
                let exp = Experience {
                    session_id: session.session_id,
                    state: s.clone(),
                    action: action.into(),
                    reward,
                    next_state: s.clone(),
                    next_actions: candidates.clone(),
                };
                assert!(learner.update(&a, &exp, rates()).await.is_learned());
            }
            let choice = learner.choose_action(&a, &ctx, &candidates, 0.0).await.unwrap();
            assert_eq!(choice.action, "integration");
        }
    }

    // ── Decision cycle ─────────────────────────────────────────

    mod cycle {
        use super::*;

        #[tokio::test]
        async fn test_cycle_walks_all_phases() {
            let dir = tempfile::tempdir().unwrap();
            let db = open_db(&dir).await;
            let learner = QLearner::new(db.clone(), &LearningConfig::default());
            let a = agent("gen");
            let session = SessionManager::new(db).open_session(&a).await.unwrap();
            let mut cycle = DecisionCycle::new(learner.clone(), a.clone(), session.session_id);
            let candidates = actions(&["unit", "fuzz"]);

            assert_eq!(cycle.phase(), CyclePhase::AwaitingAction);
            let choice = cycle.choose(&json!({"complexity": 2}), &candidates, 0.0).await.unwrap();
            assert_eq!(cycle.phase(), CyclePhase::ActionChosen);
            cycle.begin_execution().unwrap();
            assert_eq!(cycle.phase(), CyclePhase::AwaitingOutcome);

            let observation = cycle
                .complete(
                    &TaskOutcome::success(),
                    &json!({"complexity": 2}),
                    &candidates,
                    LearningRates::new(0.5, 0.9).unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(cycle.phase(), CyclePhase::ValueUpdated);
            assert!(observation.outcome.is_learned());

            let stored = learner
                .q_table()
                .get(&a, &choice.state, &choice.action)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.value, 0.5);

            cycle.reset().unwrap();
            assert_eq!(cycle.phase(), CyclePhase::AwaitingAction);
            assert!(cycle.choice().is_none());
        }

        #[tokio::test]
        async fn test_out_of_order_steps_are_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let db = open_db(&dir).await;
            let learner = QLearner::new(db, &LearningConfig::default());
            let mut cycle = DecisionCycle::new(learner, agent("gen"), uuid::Uuid::new_v4());

            let err = cycle.begin_execution().unwrap_err();
            assert!(matches!(err, AqeError::ConstraintViolation { .. }));
            assert!(cycle.reset().is_err());
            let err = cycle
                .complete(
                    &TaskOutcome::success(),
                    &json!({}),
                    &[],
                    LearningRates::new(0.1, 0.9).unwrap(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, AqeError::ConstraintViolation { .. }));
            assert_eq!(cycle.phase(), CyclePhase::AwaitingAction);

            cycle.choose(&json!({}), &actions(&["x"]), 0.0).await.unwrap();
            assert!(cycle.choose(&json!({}), &actions(&["x"]), 0.0).await.is_err());
            assert_eq!(cycle.phase(), CyclePhase::ActionChosen);
        }
    }
}
