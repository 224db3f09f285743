#[cfg(test)]
mod session_tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::command::ConfigCommand;
    use crate::core::error::{ApplyError, Error, StoreError};
    use crate::core::firewall::{
        ChangeState, DmzConfig, FirewallConfig, ForwardProtocol, PendingChange,
    };
    use crate::core::session::{ChangeSession, RecoveryPolicy, SessionOptions, StageOutcome};
    use crate::core::store::RuleStore;
    use crate::core::test_helpers::{
        RecordingApplier, StoreWatchingApplier, forward, quiet_options, snapshot_of,
        start_session, test_layout,
    };

    fn enable() -> ConfigCommand {
        ConfigCommand::SetEnabled(true)
    }

    fn staged_id(outcome: StageOutcome) -> uuid::Uuid {
        match outcome {
            StageOutcome::Staged { id, .. } => id,
            StageOutcome::Unchanged => panic!("expected a staged change"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_installs_rules_and_starts_countdown() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let reporter = session.reporter();

        let outcome = session.stage(enable()).await.unwrap();
        let StageOutcome::Staged {
            id,
            seconds_remaining,
        } = outcome
        else {
            panic!("expected a staged change");
        };
        assert_eq!(seconds_remaining, 120);

        let mut enabled = FirewallConfig::default();
        enabled.policy.set_enabled(true);
        assert_eq!(applier.applied(), vec![snapshot_of(&enabled).rules]);

        let status = reporter.get_status();
        assert!(status.enabled);
        assert!(status.pending);
        assert_eq!(status.seconds_remaining, Some(120));
        assert_eq!(status.change_id, Some(id));

        let record = session.store().load_pending().unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.state, ChangeState::Staged);
        assert_eq!(record.description, "Enable firewall");
        // active stays untouched until confirmed
        assert!(session.store().load_active().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_change_reverts_after_timeout() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let reporter = session.reporter();
        let before = snapshot_of(&FirewallConfig::default());

        session.stage(enable()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(119)).await;
        let status = reporter.get_status();
        assert!(status.pending);
        assert_eq!(status.seconds_remaining, Some(1));
        assert!(applier.rollbacks().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = reporter.get_status();
        assert!(!status.pending);
        assert!(!status.enabled);
        assert_eq!(applier.rollbacks(), vec![before.rules.clone()]);
        assert_eq!(session.store().load_active().unwrap(), Some(before));
        assert!(session.store().load_pending().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_commits_and_cancels_countdown() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let reporter = session.reporter();

        session
            .stage(ConfigCommand::AddPortForward(forward(
                ForwardProtocol::Tcp,
                8080,
                80,
            )))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        session.confirm().await.unwrap();

        let mut expected = FirewallConfig::default();
        expected.upsert_port_forward(forward(ForwardProtocol::Tcp, 8080, 80));
        let after = snapshot_of(&expected);

        assert_eq!(session.store().load_active().unwrap(), Some(after.clone()));
        assert!(session.store().load_pending().unwrap().is_none());
        assert!(!reporter.get_status().pending);
        assert_eq!(*reporter.snapshot().active, after);

        // confirm never re-applies, and the countdown is gone
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(applier.applied().len(), 1);
        assert!(applier.rollbacks().is_empty());
        assert_eq!(*reporter.snapshot().live, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_revert_restores_previous_rules() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let before = snapshot_of(&FirewallConfig::default());

        session
            .stage(ConfigCommand::BlockIp(crate::core::firewall::BlockedIp {
                ip: "203.0.113.7".parse().unwrap(),
                description: "scanner".to_string(),
            }))
            .await
            .unwrap();
        session.revert().await.unwrap();

        assert_eq!(applier.live(), Some(before.rules.clone()));
        assert_eq!(session.store().load_active().unwrap(), Some(before.clone()));
        assert!(session.store().load_pending().unwrap().is_none());
        assert_eq!(*session.reporter().snapshot().live, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_and_revert_without_pending_change() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;

        assert!(matches!(
            session.confirm().await,
            Err(Error::NoPendingChange("confirm"))
        ));
        assert!(matches!(
            session.revert().await,
            Err(Error::NoPendingChange("revert"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_while_pending_is_a_conflict() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;

        let id = staged_id(session.stage(enable()).await.unwrap());
        let record = session.store().load_pending().unwrap();

        let err = session
            .stage(ConfigCommand::AddPortForward(forward(
                ForwardProtocol::Udp,
                51820,
                51820,
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(existing) if existing == id));

        assert_eq!(session.store().load_pending().unwrap(), record);
        assert_eq!(applier.applied().len(), 1);
        assert_eq!(session.reporter().get_status().change_id, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_op_change_creates_no_pending_state() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;

        let outcome = session
            .stage(ConfigCommand::SetEnabled(false))
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Unchanged);
        assert!(applier.applied().is_empty());
        assert!(!session.reporter().get_status().pending);
        assert!(session.store().load_pending().unwrap().is_none());

        // a timer would have fired by now if one had been started
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(applier.rollbacks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_only_change_is_committed_directly() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let target = Ipv4Addr::new(192, 168, 1, 50);

        let outcome = session
            .stage(ConfigCommand::SetDmz(DmzConfig {
                enabled: false,
                target_ip: Some(target),
            }))
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::Unchanged);
        assert!(applier.applied().is_empty());
        let active = session.store().load_active().unwrap().unwrap();
        assert_eq!(active.config.dmz.target_ip, Some(target));
        assert_eq!(
            session.reporter().snapshot().live.config.dmz.target_ip,
            Some(target)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_change_is_rejected_without_side_effects() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;

        let err = session
            .stage(ConfigCommand::SetDmz(DmzConfig {
                enabled: true,
                target_ip: None,
            }))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "invalid_config");
        assert!(applier.applied().is_empty());
        assert!(session.store().load_pending().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_leaves_no_pending_change() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let before = session.reporter().snapshot().active;

        applier.fail_next_applies(1);
        let err = session.stage(enable()).await.unwrap_err();
        assert!(matches!(err, Error::Apply(ApplyError::Busy { .. })));

        let status = session.reporter().get_status();
        assert!(!status.pending);
        assert!(!status.enabled);
        assert!(session.store().load_pending().unwrap().is_none());
        assert_eq!(session.reporter().snapshot().active, before);

        // the session is usable again straight away
        let outcome = session.stage(enable()).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Staged { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_is_retried_until_it_succeeds() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let before = snapshot_of(&FirewallConfig::default());

        session.stage(enable()).await.unwrap();
        applier.fail_next_rollbacks(3);
        session.revert().await.unwrap();

        assert_eq!(applier.rollbacks(), vec![before.rules.clone()]);
        assert_eq!(session.store().load_active().unwrap(), Some(before));
        assert!(!session.reporter().get_status().pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_is_ignored() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;

        let first = staged_id(session.stage(enable()).await.unwrap());
        session.confirm().await.unwrap();
        session.expire(first).await.unwrap();
        assert!(applier.rollbacks().is_empty());

        let second = staged_id(
            session
                .stage(ConfigCommand::SetEnabled(false))
                .await
                .unwrap(),
        );
        session.expire(first).await.unwrap();
        let status = session.reporter().get_status();
        assert!(status.pending);
        assert_eq!(status.change_id, Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_countdown_revert_scenario() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let reporter = session.reporter();

        session.stage(enable()).await.unwrap();
        let status = reporter.get_status();
        assert!(status.enabled);
        assert_eq!(status.seconds_remaining, Some(120));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(reporter.get_status().seconds_remaining, Some(110));

        session.revert().await.unwrap();
        let status = reporter.get_status();
        assert!(!status.enabled);
        assert!(!status.pending);
        assert_eq!(status.seconds_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_record_is_written_before_apply() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let store = RuleStore::open(&state).unwrap();
        let applier = Arc::new(StoreWatchingApplier::new(&state));
        let session = ChangeSession::start(test_layout(), store, applier.clone(), quiet_options())
            .await
            .unwrap();

        let id = staged_id(session.stage(enable()).await.unwrap());

        let seen = applier.seen();
        assert_eq!(seen.len(), 1);
        let record = seen[0].as_ref().expect("no pending record while applying");
        assert_eq!(record.id, id);
        assert_eq!(record.state, ChangeState::Staged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_keeps_change_staged() {
        let applier = RecordingApplier::new();
        let (dir, session) = start_session(&applier, quiet_options()).await;
        let id = staged_id(session.stage(enable()).await.unwrap());

        // renaming onto a non-empty directory fails
        let blocker = dir.path().join("state").join("active.json");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"").unwrap();

        assert!(session.confirm().await.is_err());
        let record = session.store().load_pending().unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.state, ChangeState::Staged);
        let status = session.reporter().get_status();
        assert!(status.pending);
        assert_eq!(status.change_id, Some(id));

        std::fs::remove_dir_all(&blocker).unwrap();
        session.confirm().await.unwrap();
        assert!(session.store().load_pending().unwrap().is_none());
        let active = session.store().load_active().unwrap().unwrap();
        assert!(active.config.policy.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reverts_pending_change() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let before = snapshot_of(&FirewallConfig::default());

        session.stage(enable()).await.unwrap();
        session.shutdown().await.unwrap();

        assert_eq!(applier.live(), Some(before.rules.clone()));
        assert!(session.store().load_pending().unwrap().is_none());
        assert_eq!(session.store().load_active().unwrap(), Some(before));
        let status = session.reporter().get_status();
        assert!(!status.pending);
        assert!(!status.enabled);

        session.shutdown().await.unwrap();
        assert_eq!(applier.rollbacks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_rules_follow_install_order() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, quiet_options()).await;
        let mut enabled = FirewallConfig::default();
        enabled.policy.set_enabled(true);

        session.stage(enable()).await.unwrap();
        session.revert().await.unwrap();
        assert_eq!(
            applier.live(),
            Some(snapshot_of(&FirewallConfig::default()).rules)
        );

        session.stage(enable()).await.unwrap();
        assert_eq!(applier.live(), Some(snapshot_of(&enabled).rules));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_on_same_directory_is_refused() {
        let applier = RecordingApplier::new();
        let (dir, session) = start_session(&applier, quiet_options()).await;
        let state = dir.path().join("state");

        let second = ChangeSession::start(
            test_layout(),
            RuleStore::open(&state).unwrap(),
            Arc::new(applier.clone()),
            quiet_options(),
        )
        .await;
        assert!(matches!(
            second,
            Err(Error::Store(StoreError::Locked { .. }))
        ));

        drop(session);
        let third = ChangeSession::start(
            test_layout(),
            RuleStore::open(&state).unwrap(),
            Arc::new(applier.clone()),
            quiet_options(),
        )
        .await;
        assert!(third.is_ok());
    }

    fn seeded_store(change: &PendingChange) -> (tempfile::TempDir, RuleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path().join("state")).unwrap();
        store.commit_active(&change.before).unwrap();
        store.persist_pending(change).unwrap();
        (dir, store)
    }

    fn enable_change() -> PendingChange {
        let mut enabled = FirewallConfig::default();
        enabled.policy.set_enabled(true);
        PendingChange::new(
            "Enable firewall",
            snapshot_of(&FirewallConfig::default()),
            snapshot_of(&enabled),
        )
    }

    async fn restart(
        store: RuleStore,
        applier: &RecordingApplier,
        options: SessionOptions,
    ) -> Arc<ChangeSession> {
        ChangeSession::start(test_layout(), store, Arc::new(applier.clone()), options)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reverts_staged_change() {
        let change = enable_change();
        let (_dir, store) = seeded_store(&change);
        let applier = RecordingApplier::new();

        let session = restart(store, &applier, SessionOptions::default()).await;

        assert_eq!(applier.rollbacks(), vec![change.before.rules.clone()]);
        // rollback already installed the active rules
        assert!(applier.applied().is_empty());
        assert_eq!(session.store().load_active().unwrap(), Some(change.before));
        assert!(session.store().load_pending().unwrap().is_none());
        let status = session.reporter().get_status();
        assert!(!status.pending);
        assert!(!status.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_finishes_interrupted_revert() {
        let change = enable_change().with_state(ChangeState::Reverted);
        let (_dir, store) = seeded_store(&change);
        let applier = RecordingApplier::new();

        let options = SessionOptions {
            recovery: RecoveryPolicy::Resume,
            ..quiet_options()
        };
        let session = restart(store, &applier, options).await;

        assert_eq!(applier.rollbacks(), vec![change.before.rules.clone()]);
        assert!(!session.reporter().get_status().pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_finishes_interrupted_confirm() {
        let change = enable_change().with_state(ChangeState::Confirmed);
        let (_dir, store) = seeded_store(&change);
        let applier = RecordingApplier::new();

        let session = restart(store, &applier, SessionOptions::default()).await;

        assert!(applier.rollbacks().is_empty());
        assert_eq!(applier.applied(), vec![change.after.rules.clone()]);
        assert_eq!(
            session.store().load_active().unwrap(),
            Some(change.after.clone())
        );
        assert!(session.store().load_pending().unwrap().is_none());
        assert!(session.reporter().get_status().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_countdown() {
        let mut change = enable_change();
        change.created_at -= chrono::Duration::seconds(30);
        let (_dir, store) = seeded_store(&change);
        let applier = RecordingApplier::new();

        let options = SessionOptions {
            recovery: RecoveryPolicy::Resume,
            ..quiet_options()
        };
        let session = restart(store, &applier, options).await;
        let reporter = session.reporter();

        assert_eq!(applier.applied(), vec![change.after.rules.clone()]);
        let status = reporter.get_status();
        assert!(status.pending);
        assert_eq!(status.change_id, Some(change.id));
        let remaining = status.seconds_remaining.unwrap();
        assert!((89..=90).contains(&remaining), "remaining = {remaining}");

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(!reporter.get_status().pending);
        assert_eq!(applier.rollbacks(), vec![change.before.rules.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reverts_expired_change_even_when_resuming() {
        let mut change = enable_change();
        change.created_at -= chrono::Duration::seconds(600);
        let (_dir, store) = seeded_store(&change);
        let applier = RecordingApplier::new();

        let options = SessionOptions {
            recovery: RecoveryPolicy::Resume,
            ..quiet_options()
        };
        let session = restart(store, &applier, options).await;

        assert!(applier.applied().is_empty());
        assert_eq!(applier.rollbacks(), vec![change.before.rules.clone()]);
        assert!(!session.reporter().get_status().pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_installs_active_rules() {
        let applier = RecordingApplier::new();
        let (_dir, session) = start_session(&applier, SessionOptions::default()).await;

        assert_eq!(
            applier.applied(),
            vec![snapshot_of(&FirewallConfig::default()).rules]
        );
        assert!(!session.reporter().get_status().pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_apply_failure_is_reported() {
        let applier = RecordingApplier::new();
        applier.fail_next_applies(1);
        let dir = tempfile::tempdir().unwrap();
        let store = RuleStore::open(dir.path()).unwrap();

        let result = ChangeSession::start(
            test_layout(),
            store,
            Arc::new(applier.clone()),
            SessionOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Apply(_))));
    }

    #[test]
    fn test_recovery_policy_parsing() {
        assert_eq!(
            "resume".parse::<RecoveryPolicy>().unwrap(),
            RecoveryPolicy::Resume
        );
        assert_eq!(
            "REVERT".parse::<RecoveryPolicy>().unwrap(),
            RecoveryPolicy::Revert
        );
        assert_eq!(RecoveryPolicy::default(), RecoveryPolicy::Revert);
        assert_eq!(RecoveryPolicy::Resume.to_string(), "resume");
    }
}

#[cfg(test)]
mod property_tests {
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    use proptest::prelude::*;

    use crate::core::compiler::compile;
    use crate::core::firewall::{
        BlockedIp, DmzConfig, FirewallConfig, ForwardProtocol, PortForward,
    };
    use crate::core::ruleset::{ChainKind, Match, Verdict};
    use crate::core::test_helpers::test_layout;

    prop_compose! {
        fn arb_protocol()(protocol in prop_oneof![
            Just(ForwardProtocol::Tcp),
            Just(ForwardProtocol::Udp),
            Just(ForwardProtocol::Both),
        ]) -> ForwardProtocol {
            protocol
        }
    }

    prop_compose! {
        fn arb_internal_ip()(b in 0u8..=255, c in 0u8..=255, d in 1u8..=254) -> Ipv4Addr {
            Ipv4Addr::new(10, b, c, d)
        }
    }

    prop_compose! {
        fn arb_blocked_ip()(a in 1u8..=126, b in 0u8..=255, c in 0u8..=255, d in 1u8..=254) -> IpAddr {
            IpAddr::V4(Ipv4Addr::new(a, b, c, d))
        }
    }

    prop_compose! {
        // one forward per external port, so generated configs never overlap
        fn arb_forwards()(
            by_port in prop::collection::btree_map(
                1u16..=65535,
                (arb_protocol(), arb_internal_ip(), 1u16..=65535, "[a-zA-Z0-9 ]{0,20}"),
                0..8,
            )
        ) -> Vec<PortForward> {
            by_port
                .into_iter()
                .map(|(external_port, (protocol, internal_ip, internal_port, description))| {
                    PortForward {
                        protocol,
                        external_port,
                        internal_ip,
                        internal_port,
                        description,
                    }
                })
                .collect()
        }
    }

    prop_compose! {
        fn arb_config()(
            enabled in any::<bool>(),
            forwards in arb_forwards(),
            blocked in prop::collection::vec(arb_blocked_ip(), 0..6),
            dmz in proptest::option::of(arb_internal_ip()),
        ) -> (FirewallConfig, Vec<PortForward>, Vec<IpAddr>) {
            let mut config = FirewallConfig::default();
            config.policy.set_enabled(enabled);
            config.dmz = DmzConfig {
                enabled: dmz.is_some(),
                target_ip: dmz,
            };
            for forward in &forwards {
                config.upsert_port_forward(forward.clone());
            }
            for ip in &blocked {
                config.block_ip(BlockedIp { ip: *ip, description: String::new() });
            }
            (config, forwards, blocked)
        }
    }

    proptest! {
        #[test]
        fn test_compile_is_deterministic((config, forwards, blocked) in arb_config()) {
            let layout = test_layout();
            let first = compile(&config, &layout).unwrap();
            prop_assert_eq!(&first, &compile(&config, &layout).unwrap());

            // same content added in the opposite order
            let mut reordered = FirewallConfig {
                policy: config.policy.clone(),
                dmz: config.dmz.clone(),
                port_forwards: BTreeMap::new(),
                blocked_ips: BTreeMap::new(),
            };
            for forward in forwards.iter().rev() {
                reordered.upsert_port_forward(forward.clone());
            }
            for ip in blocked.iter().rev() {
                reordered.block_ip(BlockedIp { ip: *ip, description: String::new() });
            }
            let second = compile(&reordered, &layout).unwrap();
            prop_assert_eq!(first.fingerprint(), second.fingerprint());
            prop_assert_eq!(first.to_nft_text(), second.to_nft_text());
        }

        #[test]
        fn test_blocklist_precedes_forward_and_dmz_accepts((config, _, _) in arb_config()) {
            let rules = compile(&config, &test_layout()).unwrap();
            let forward_chain: Vec<_> = rules.rules_in(ChainKind::Forward).collect();

            let last_block = forward_chain
                .iter()
                .rposition(|r| r.verdict == Verdict::Drop
                    && matches!(r.matches.first(), Some(Match::SourceNet(_))));
            let first_target_accept = forward_chain
                .iter()
                .position(|r| r.verdict == Verdict::Accept
                    && r.matches.iter().any(|m| matches!(m, Match::DestAddr(_))));

            if let (Some(block), Some(accept)) = (last_block, first_target_accept) {
                prop_assert!(block < accept);
            }
        }

        #[test]
        fn test_every_forward_has_dnat_and_accept((config, forwards, _) in arb_config()) {
            let rules = compile(&config, &test_layout()).unwrap();
            let dnats = rules
                .rules_in(ChainKind::Prerouting)
                .filter(|r| matches!(r.verdict, Verdict::Dnat { port: Some(_), .. }))
                .count();
            prop_assert_eq!(dnats, forwards.len());

            // explicit forwards are matched before the DMZ catch-all
            if config.dmz.enabled {
                let last = rules.rules_in(ChainKind::Prerouting).last().unwrap();
                let catch_all_is_last = matches!(last.verdict, Verdict::Dnat { port: None, .. });
                prop_assert!(catch_all_is_last);
            }
        }
    }
}
