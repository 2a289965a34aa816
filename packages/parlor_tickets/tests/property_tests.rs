use std::collections::HashSet;
use std::time::Duration;

use parlor_tickets::{TicketConfig, TicketStore};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime")
}

// --- Single use ---

proptest! {
    #[test]
    fn every_ticket_verifies_exactly_once(count in 1usize..32, extra_attempts in 1usize..4) {
        let rt = runtime();
        rt.block_on(async {
            let store = TicketStore::default();
            let mut keys = Vec::with_capacity(count);
            for _ in 0..count {
                keys.push(store.mint().await.key);
            }

            for key in &keys {
                prop_assert!(store.verify(key).await);
                for _ in 0..extra_attempts {
                    prop_assert!(!store.verify(key).await);
                }
            }
            prop_assert!(store.is_empty().await);
            Ok(())
        })?;
    }

    #[test]
    fn keys_never_collide(count in 1usize..64) {
        let rt = runtime();
        rt.block_on(async {
            let store = TicketStore::default();
            let mut seen = HashSet::new();
            for _ in 0..count {
                prop_assert!(seen.insert(store.mint().await.key));
            }
            prop_assert_eq!(store.len().await, count);
            Ok(())
        })?;
    }

    #[test]
    fn arbitrary_strings_are_rejected(guess in "\\PC{0,40}") {
        let rt = runtime();
        rt.block_on(async {
            let store = TicketStore::default();
            let minted = store.mint().await;
            prop_assume!(guess != minted.key);
            prop_assert!(!store.verify(&guess).await);
            prop_assert!(store.verify(&minted.key).await);
            Ok(())
        })?;
    }
}

// --- Sweep ---

proptest! {
    #[test]
    fn sweep_with_zero_retention_clears_everything(count in 0usize..16) {
        let rt = runtime();
        rt.block_on(async {
            let store = TicketStore::new(TicketConfig {
                retention: Duration::ZERO,
                sweep_interval: Duration::from_millis(400),
            });
            for _ in 0..count {
                store.mint().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            prop_assert_eq!(store.sweep().await, count);
            prop_assert!(store.is_empty().await);
            Ok(())
        })?;
    }
}
