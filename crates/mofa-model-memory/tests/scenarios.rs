//! End-to-end ledger scenarios as an engine and orchestrator would drive them.

use mofa_model_memory::{MemoryLedger, MemoryManagerConfig, ModelHandle};

const MB: u64 = 1024 * 1024;

fn h(raw: u64) -> ModelHandle {
    ModelHandle::new(raw)
}

fn assert_sum_invariant(ledger: &MemoryLedger) {
    let sum: u64 = ledger
        .tracked_handles()
        .into_iter()
        .map(|handle| ledger.model_memory_usage(handle))
        .sum();
    assert_eq!(ledger.total_memory_usage(), sum);
}

#[test]
fn lru_model_after_reaccessing_first_and_third() {
    let ledger = MemoryLedger::unlimited();
    for raw in 1..=5 {
        ledger.track_allocation(h(raw), 10 * MB).unwrap();
    }
    for raw in 1..=5 {
        ledger.record_access(h(raw));
    }
    ledger.record_access(h(1));
    ledger.record_access(h(3));

    assert_eq!(ledger.lru_model(), Some(h(2)));
}

#[test]
fn eviction_candidates_cover_required_bytes_oldest_first() {
    let ledger = MemoryLedger::unlimited();
    ledger.track_allocation(h(1), 10 * MB).unwrap();
    ledger.track_allocation(h(2), 20 * MB).unwrap();
    ledger.track_allocation(h(3), 30 * MB).unwrap();
    for raw in 1..=3 {
        ledger.record_access(h(raw));
    }
    ledger.record_access(h(3));

    let candidates = ledger.eviction_candidates(25 * MB);
    assert_eq!(candidates, vec![h(1), h(2)]);
    assert!(!candidates.contains(&h(3)));
}

#[test]
fn orchestrator_flow_load_pin_evict() -> anyhow::Result<()> {
    let ledger = MemoryLedger::try_new(
        MemoryManagerConfig::default()
            .with_memory_limit(100 * MB)
            .with_pressure_threshold(0.9)?,
    )?;
    let (llm, stt, tts) = (h(1), h(2), h(3));

    ledger.track_allocation(llm, 60 * MB)?;
    ledger.track_allocation(stt, 25 * MB)?;
    assert!(!ledger.is_memory_pressure());

    // Speech-to-text is mid-transcription while TTS wants to load.
    let pin = ledger.pin(stt)?;
    ledger.record_access(stt);
    assert!(ledger.needs_eviction(30 * MB));

    let plan = ledger.plan_eviction(15 * MB);
    assert_eq!(plan.candidates, vec![llm]);
    assert!(plan.is_sufficient());

    // The orchestrator unloads the LLM; the engine reports back.
    assert_eq!(ledger.track_deallocation(llm), 60 * MB);
    ledger.track_allocation(tts, 30 * MB)?;
    drop(pin);

    assert_eq!(ledger.total_memory_usage(), 55 * MB);
    assert_eq!(ledger.memory_usage_percentage(), Some(55.0));
    assert!(ledger.can_evict(stt));
    assert_eq!(ledger.lru_model(), Some(stt));
    assert_sum_invariant(&ledger);
    Ok(())
}

#[test]
fn pinned_models_never_offered() {
    let ledger = MemoryLedger::unlimited();
    for raw in 1..=6 {
        ledger.track_allocation(h(raw), raw * MB).unwrap();
    }
    for raw in [2, 4, 6] {
        ledger.increment_ref_count(h(raw)).unwrap();
    }

    for required in [0, MB, 5 * MB, 100 * MB] {
        let candidates = ledger.eviction_candidates(required);
        for raw in [2, 4, 6] {
            assert!(!candidates.contains(&h(raw)));
            assert!(!ledger.can_evict(h(raw)));
        }
    }
    assert_eq!(ledger.eviction_candidates(100 * MB), vec![h(1), h(3), h(5)]);
}

#[test]
fn sum_invariant_through_mixed_operations() {
    let ledger = MemoryLedger::unlimited();
    for raw in 0..50 {
        ledger.track_allocation(h(raw), (raw % 7 + 1) * MB).unwrap();
        if raw % 3 == 0 {
            ledger.track_deallocation(h(raw / 2));
        }
        if raw % 5 == 0 {
            let _ = ledger.track_allocation(h(raw), MB);
        }
        assert_sum_invariant(&ledger);
    }

    let stats = ledger.stats();
    assert_eq!(
        stats.models.iter().map(|m| m.bytes).sum::<u64>(),
        stats.total_usage_bytes
    );
}

#[test]
fn pressure_clears_after_deallocation() {
    let ledger = MemoryLedger::new(
        MemoryManagerConfig::default()
            .with_memory_limit(1000)
            .with_pressure_threshold(0.8)
            .unwrap(),
    );
    ledger.track_allocation(h(1), 700).unwrap();
    assert!(!ledger.is_memory_pressure());

    ledger.track_allocation(h(2), 100).unwrap();
    assert!(ledger.is_memory_pressure());

    ledger.track_deallocation(h(1));
    assert!(!ledger.is_memory_pressure());
}
