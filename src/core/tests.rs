#[cfg(test)]
mod tests_impl {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use crate::core::error::Error;
    use crate::core::nat::{self, ApplyRules, NatCompiler};
    use crate::core::ports::{to_kernel_range, validate_pair};
    use crate::core::resolver::{ChainResolver, Resolve};
    use crate::core::rule::{Protocol, Rule};
    use crate::core::schema::{Generation, decode_line};
    use crate::core::store::{RuleStore, parse_rules, render_rules};
    use crate::core::test_helpers::{
        CountingApplier, MockResolver, RecordingBackend, domain_rule, failing, fixed, ip_rule,
    };
    use crate::core::transaction::Transaction;
    use crate::core::watcher::Watcher;

    fn resolved(mut rule: Rule, ip: &str, at: i64) -> Rule {
        rule.resolved_ip = ip.to_string();
        rule.last_checked_at = at;
        rule
    }

    #[test]
    fn test_round_trip_every_generation() {
        let lines = [
            ("8080|127.0.0.1|1080|both", Generation::Legacy),
            ("10.0.0.1|8000-8010|10.0.0.2|9000-9010|udp", Generation::Scoped),
            (
                "0.0.0.0|443|example.com|8443|tcp|93.184.216.34|600|1700000000|true",
                Generation::Canonical,
            ),
        ];

        for (line, generation) in lines {
            let decoded = decode_line(line).unwrap();
            assert_eq!(decoded.generation, generation);

            let rendered = render_rules(std::slice::from_ref(&decoded.rule));
            let (reloaded, report) = parse_rules(&rendered);
            assert_eq!(reloaded, vec![decoded.rule], "{line}");
            assert_eq!(report.migrated, 0);
        }
    }

    #[test]
    fn test_legacy_migration_example() {
        let rule = decode_line("8080|127.0.0.1|1080|both").unwrap().rule;
        assert_eq!(rule.listen_ip, Ipv4Addr::UNSPECIFIED);
        assert!(!rule.is_domain);
        assert_eq!(rule.resolved_ip, "127.0.0.1");
        assert_eq!(
            render_rules(&[rule]).lines().last(),
            Some("0.0.0.0|8080|127.0.0.1|1080|both|127.0.0.1|300|0|false")
        );
    }

    #[test]
    fn test_port_pairing_examples() {
        assert!(validate_pair("8080", "9090").is_ok());
        assert!(validate_pair("8000-9000", "18000-19000").is_ok());
        assert!(matches!(
            validate_pair("8000-9000", "18000-18500"),
            Err(Error::PortArityMismatch {
                src_len: 1001,
                dst_len: 501
            })
        ));
        assert!(matches!(
            validate_pair("8080", "9000-9100"),
            Err(Error::PortArityMismatch { .. })
        ));
        assert_eq!(to_kernel_range("8000-9000"), "8000:9000");
        assert_eq!(to_kernel_range("8080"), "8080");
    }

    #[tokio::test]
    async fn test_fallback_stops_at_third_direct_resolver() {
        let resolvers = [
            failing("dns:1.1.1.1:53"),
            failing("dns:1.0.0.1:53"),
            fixed("dns:8.8.8.8:53", Ipv4Addr::new(7, 7, 7, 7)),
            fixed("dns:8.8.4.4:53", Ipv4Addr::new(6, 6, 6, 6)),
            fixed("doh:cloudflare", Ipv4Addr::new(5, 5, 5, 5)),
            fixed("doh:google", Ipv4Addr::new(4, 4, 4, 4)),
        ];
        let calls: Vec<_> = resolvers.iter().map(|r| Arc::clone(&r.calls)).collect();
        let chain = ChainResolver::new(
            resolvers
                .into_iter()
                .map(|r| Box::new(r) as Box<dyn Resolve>)
                .collect(),
        );

        assert_eq!(
            chain.resolve("example.com").await.unwrap(),
            Ipv4Addr::new(7, 7, 7, 7)
        );
        let counts: Vec<usize> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, vec![1, 1, 1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_deletion_indexing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();

        let first = ip_rule("1001", "10.0.0.1", "1001");
        let second = ip_rule("1002", "10.0.0.2", "1002");
        let third = ip_rule("1003", "10.0.0.3", "1003");
        for rule in [&first, &second, &third] {
            store.add(rule.clone()).await.unwrap();
        }

        assert_eq!(store.remove(2).await.unwrap(), second);
        assert_eq!(store.rules(), [first.clone(), third.clone()]);

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(matches!(
            store.remove(5).await,
            Err(Error::OutOfRange { index: 5, len: 2 })
        ));
        assert_eq!(store.rules(), [first, third]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), on_disk);
    }

    #[tokio::test]
    async fn test_unchanged_address_updates_timestamp_without_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();
        store
            .add(resolved(domain_rule("443", "stable.example", "443"), "9.9.9.9", 100))
            .await
            .unwrap();

        let applier = Arc::new(CountingApplier::new());
        let watcher = Watcher::new(
            Arc::new(fixed("dns", Ipv4Addr::new(9, 9, 9, 9))),
            applier.clone(),
        );

        let report = watcher.run_once(&mut store, 1_000).await.unwrap();
        assert_eq!(report.due, 1);
        assert!(report.changed.is_empty());
        assert!(!report.applied);
        assert_eq!(applier.calls.load(Ordering::SeqCst), 0);

        // Saved unconditionally
        let (on_disk, _) = parse_rules(&std::fs::read_to_string(&path).unwrap());
        assert_eq!(on_disk[0].last_checked_at, 1_000);
    }

    #[tokio::test]
    async fn test_multiple_changes_apply_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();
        for (port, domain) in [("1", "a.example"), ("2", "b.example"), ("3", "c.example")] {
            store
                .add(resolved(domain_rule(port, domain, port), "1.1.1.1", 0))
                .await
                .unwrap();
        }
        store.add(ip_rule("4", "10.0.0.4", "4")).await.unwrap();

        let resolver = MockResolver::new("dns")
            .with_answer("a.example", Ipv4Addr::new(2, 2, 2, 2))
            .with_answer("b.example", Ipv4Addr::new(3, 3, 3, 3))
            .with_answer("c.example", Ipv4Addr::new(1, 1, 1, 1));
        let applier = Arc::new(CountingApplier::new());
        let watcher = Watcher::new(Arc::new(resolver), applier.clone());

        let report = watcher.run_once(&mut store, 5_000).await.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.changed.len(), 2);
        assert!(report.applied);
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);

        let applied = applier.last_applied();
        assert_eq!(applied.len(), 4);
        assert_eq!(applied[0].resolved_ip, "2.2.2.2");
        assert_eq!(applied[1].resolved_ip, "3.3.3.3");
        assert_eq!(applied[2].resolved_ip, "1.1.1.1");
    }

    #[tokio::test]
    async fn test_failed_reapply_restores_pre_tick_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();
        store
            .add(resolved(domain_rule("80", "moving.example", "80"), "1.1.1.1", 0))
            .await
            .unwrap();

        let resolver = Arc::new(fixed("dns", Ipv4Addr::new(2, 2, 2, 2)));
        let watcher = Watcher::new(resolver.clone(), Arc::new(CountingApplier::failing_first(1)));
        assert!(watcher.run_once(&mut store, 1_000).await.is_err());
        assert_eq!(store.get(1).unwrap().resolved_ip, "1.1.1.1");

        // Next tick sees the same change and applies it
        let applier = Arc::new(CountingApplier::new());
        let watcher = Watcher::new(resolver, applier.clone());
        let report = watcher.run_once(&mut store, 2_000).await.unwrap();
        assert!(report.applied);
        assert_eq!(store.get(1).unwrap().resolved_ip, "2.2.2.2");
    }

    #[tokio::test]
    async fn test_watcher_tick_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        std::fs::write(
            &path,
            "0.0.0.0|53|dns.example|53|udp|1.1.1.1|60|0|true\n",
        )
        .unwrap();

        let applier = Arc::new(CountingApplier::new());
        let watcher = Watcher::new(
            Arc::new(fixed("dns", Ipv4Addr::new(8, 8, 8, 8))),
            applier.clone(),
        );
        let report = watcher.tick(&path).await.unwrap();
        assert!(report.applied);

        // The lock was released after the tick
        let (store, _) = RuleStore::try_open(&path, &failing("dns")).await.unwrap();
        assert_eq!(store.get(1).unwrap().resolved_ip, "8.8.8.8");
    }

    #[tokio::test]
    async fn test_tick_applies_first_resolution_of_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        // Saved while DNS was down; the second one failed an attempt recently
        std::fs::write(
            &path,
            "0.0.0.0|443|example.com|443|tcp|example.com|60|0|true\n\
             0.0.0.0|80|www.example.com|80|tcp|www.example.com|60|4000000000|true\n",
        )
        .unwrap();

        let applier = Arc::new(CountingApplier::new());
        let watcher = Watcher::new(
            Arc::new(fixed("dns", Ipv4Addr::new(93, 184, 216, 34))),
            applier.clone(),
        );

        let report = watcher.tick(&path).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.changed.len(), 2);
        assert_eq!(report.changed[0].old, "example.com");
        assert_eq!(report.changed[0].new, "93.184.216.34");
        assert!(report.applied);
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
        assert!(
            applier
                .last_applied()
                .iter()
                .all(|rule| rule.resolved_ip == "93.184.216.34")
        );

        // Resolved now, so the next tick has nothing to push
        let report = watcher.tick(&path).await.unwrap();
        assert_eq!(report.due, 0);
        assert!(!report.applied);
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_through_transaction_with_recording_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();

        let backend = RecordingBackend::new();
        let ops = Arc::clone(&backend.ops);
        let compiler = NatCompiler::new(backend);

        let tx = Transaction::stage(&store, Some(&dir.path().join("backups")))
            .await
            .unwrap();
        store
            .add(Rule::new("192.168.0.1", "2222", "10.0.0.9", "22", Protocol::Tcp).unwrap())
            .await
            .unwrap();
        let summary = tx.apply(&mut store, &compiler).await.unwrap();

        assert_eq!(summary.operations, 4);
        assert_eq!(*ops.lock().unwrap(), nat::compile(store.rules()));
    }

    #[tokio::test]
    async fn test_rollback_reapplies_previous_rules_through_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.conf");
        let (mut store, _) = RuleStore::open(&path, &failing("dns")).await.unwrap();
        store.add(ip_rule("22", "10.0.0.2", "22")).await.unwrap();

        // Fails the first DNAT of the new rule set, succeeds on the restore pass
        let backend = RecordingBackend::failing_at(3);
        let ops = Arc::clone(&backend.ops);
        let compiler = NatCompiler::new(backend);

        let tx = Transaction::stage(&store, None).await.unwrap();
        store.add(ip_rule("80", "10.0.0.3", "80")).await.unwrap();

        let err = tx.apply(&mut store, &compiler).await.unwrap_err();
        assert!(matches!(err, Error::RolledBack { .. }));
        assert_eq!(err.nat_stderr(), Some("iptables: Bad argument `DNAT'"));
        assert_eq!(store.len(), 1);

        // 4 ops until the failure, then a full pass for the single old rule
        let ops = ops.lock().unwrap();
        assert_eq!(ops.len(), 4 + 5);
        assert_eq!(ops[4..], nat::compile(store.rules())[..]);
    }

    #[tokio::test]
    async fn test_apply_skips_unresolved_rules() {
        let compiler = NatCompiler::new(RecordingBackend::new());
        let summary = compiler
            .apply(&[domain_rule("443", "pending.example", "443")])
            .await
            .unwrap();
        assert_eq!(summary.rules_compiled, 0);
        assert_eq!(summary.rules_skipped, 1);
        assert_eq!(summary.operations, 3);
    }
}
