//! Stress tests for concurrent authentication and reloads
//!
//! These verify decisions stay correct when many connection workers run
//! alongside the administrative reload path.

use busgate::auth::{IdentityKeyPair, Nonce, Permissions, PublicKeyUser, SubjectPermission, User};
use busgate::config::AuthOptions;
use busgate::server::{AuthServer, ConnectOptions, ConnectionKind, ServerMessage};
use busgate::subjects::{Subject, SubjectPattern};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

fn pat(s: &str) -> SubjectPattern {
    SubjectPattern::parse(s).unwrap()
}

/// Nonces must not repeat within a large batch
#[test]
fn test_nonce_batch_has_no_collisions() {
    let batch = 100_000;
    let nonces: HashSet<String> = (0..batch).map(|_| Nonce::generate().to_string()).collect();
    assert_eq!(nonces.len(), batch);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_authentication() {
    let keys: Vec<IdentityKeyPair> = (0..16).map(|_| IdentityKeyPair::generate()).collect();
    let opts = AuthOptions::new()
        .with_users((0..16).map(|i| User::new(format!("user{}", i), format!("pw{}", i))))
        .with_public_keys(keys.iter().map(|k| PublicKeyUser::new(k.public_identity().encode())));
    let server = Arc::new(AuthServer::new(opts).unwrap());
    let keys = Arc::new(keys);

    let mut handles = vec![];
    for i in 0..200usize {
        let server = server.clone();
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(8);
            let (conn, info) = server.accept_connection(ConnectionKind::Client, tx);
            let n = i % 16;

            let (options, expect) = match i % 4 {
                0 => (ConnectOptions::default().with_user(format!("user{}", n), format!("pw{}", n)), true),
                1 => (ConnectOptions::default().with_user(format!("user{}", n), "wrong"), false),
                2 => {
                    let nonce = Nonce::decode(info.nonce.as_deref().unwrap()).unwrap();
                    let kp = &keys[n];
                    (
                        ConnectOptions::default()
                            .with_public_key(kp.public_identity().encode(), kp.sign_nonce(&nonce)),
                        true,
                    )
                }
                _ => {
                    // Signature over someone else's nonce
                    let kp = &keys[n];
                    (
                        ConnectOptions::default().with_public_key(
                            kp.public_identity().encode(),
                            kp.sign_nonce(&Nonce::generate()),
                        ),
                        false,
                    )
                }
            };

            assert_eq!(server.authenticate(&conn, options).is_accepted(), expect, "worker {}", i);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    // Rejected connections were closed and dropped
    assert_eq!(server.connection_count(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_racing_reload_leaves_no_forbidden_subscriptions() {
    let open = AuthOptions::new().with_users([User::new("alice", "secret")]);
    let narrow = AuthOptions::new().with_users([User::new("alice", "secret")
        .with_permissions(Permissions::new().with_subscribe(SubjectPermission::allow([pat("ok.>")])))]);
    let server = Arc::new(AuthServer::new(open.clone()).unwrap());

    let mut conns = vec![];
    for _ in 0..8 {
        let (tx, rx) = mpsc::channel::<ServerMessage>(4096);
        let (conn, _) = server.accept_connection(ConnectionKind::Client, tx);
        assert!(server
            .authenticate(&conn, ConnectOptions::default().with_user("alice", "secret"))
            .is_accepted());
        conns.push((conn, rx));
    }

    let mut workers = vec![];
    for (idx, (conn, _)) in conns.iter().enumerate() {
        let server = server.clone();
        let conn = conn.clone();
        workers.push(tokio::spawn(async move {
            for j in 0..200 {
                let subject = if j % 2 == 0 {
                    format!("ok.{}.{}", idx, j)
                } else {
                    format!("bad.{}.{}", idx, j)
                };
                let _ = server.subscribe(&conn, j.to_string(), &subject);
                tokio::task::yield_now().await;
            }
        }));
    }

    let reloader = {
        let server = server.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let opts = if round % 2 == 0 { narrow.clone() } else { open.clone() };
                server.reload(opts).unwrap();
                tokio::task::yield_now().await;
            }
            // Finish narrowed
            server.reload(narrow).unwrap();
        })
    };

    for worker in workers {
        worker.await.unwrap();
    }
    reloader.await.unwrap();

    // One more sweep once everything has settled
    for (conn, _) in &conns {
        server.remove_unauthorized_subs(conn);
    }

    let forbidden = Subject::parse("bad.0.1").unwrap();
    assert!(server.sublist().matches(&forbidden).is_empty());
    for (conn, _) in &conns {
        assert!(!conn.is_closed());
        for sub in conn.subscriptions() {
            assert!(sub.subject.as_str().starts_with("ok."), "leaked {}", sub.subject);
        }
    }
    let indexed: usize = conns.iter().map(|(c, _)| c.subscription_count()).sum();
    assert_eq!(server.sublist().count(), indexed);
}

#[test]
fn test_decisions_see_one_configuration() {
    let users = AuthOptions::new().with_users([User::new("alice", "secret")]);
    let token = AuthOptions::new().with_token("T");
    let server = Arc::new(AuthServer::new(users.clone()).unwrap());

    std::thread::scope(|s| {
        let reloader = s.spawn(|| {
            for round in 0..500 {
                let opts = if round % 2 == 0 { token.clone() } else { users.clone() };
                server.reload(opts).unwrap();
            }
        });

        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..2_000 {
                    let snapshot = server.authorizer().snapshot();
                    // Options and store always come from the same reload
                    assert_eq!(snapshot.options.token.is_some(), snapshot.store.user_count() == 0);
                    assert_eq!(snapshot.generation % 2 == 0, snapshot.options.token.is_some());
                }
            });
        }

        reloader.join().unwrap();
    });

    assert_eq!(server.authorizer().generation(), 501);
}

/// Permission checks should not degrade badly with long allow lists
#[test]
fn test_permission_check_scales_with_allow_list() {
    let sizes = [100, 1_000, 10_000];
    let mut times = vec![];

    for &size in &sizes {
        let allow: Vec<SubjectPattern> =
            (0..size).map(|i| pat(&format!("project.{}.updates", i))).collect();
        let perms = Permissions::new().with_publish(SubjectPermission::allow(allow));

        let iterations = 1_000;
        let start = Instant::now();
        for i in 0..iterations {
            let subject = Subject::parse(&format!("project.{}.updates", i % size)).unwrap();
            assert!(perms.can_publish(&subject));
        }
        let per_check_ns = start.elapsed().as_nanos() / iterations as u128;
        times.push((size, per_check_ns.max(1)));

        println!("Allow list: {:>6}, Per check: {}ns", size, per_check_ns);
    }

    let (small_count, small_time) = times[0];
    let (large_count, large_time) = times[times.len() - 1];
    let count_ratio = large_count as f64 / small_count as f64;
    let time_ratio = large_time as f64 / small_time as f64;

    // Linear scan is expected; quadratic would be ~count_ratio squared
    assert!(
        time_ratio < count_ratio * 10.0,
        "Permission check looks quadratic: {:.0}x entries took {:.1}x time",
        count_ratio,
        time_ratio
    );
}
