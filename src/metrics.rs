// SPDX-License-Identifier: BSD-3-Clause-LBNL
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec, Opts};
use std::sync::LazyLock;

// Counters
pub static FRAGMENTS_RECEIVED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "filerecon_fragments_received_total",
            "The total number of fragments handed to an assembler"
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static FRAGMENTS_DROPPED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "filerecon_fragments_dropped_total",
            "Fragments dropped as duplicates or for exceeding the declared length"
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static FILES_RECONSTRUCTED: LazyLock<CounterVec> = LazyLock::new(|| {
    register_counter_vec!(
        Opts::new(
            "filerecon_files_reconstructed_total",
            "The total number of reconstructed files emitted"
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static PARTIAL_MERGES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "filerecon_partial_merges_total",
        "The total number of range fragment sets merged into a complete file"
    ))
    .unwrap()
});

pub static ANOMALIES: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "filerecon_anomalies_total",
        "The total number of anomalies reported"
    ))
    .unwrap()
});

pub static ASSEMBLERS_EVICTED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "filerecon_assemblers_evicted_total",
        "Assemblers evicted from the registry before they finished"
    ))
    .unwrap()
});

pub static FILES_CARVED: LazyLock<Counter> = LazyLock::new(|| {
    register_counter!(Opts::new(
        "filerecon_files_carved_total",
        "The total number of sub-files carved out of reconstructed files"
    ))
    .unwrap()
});

/// Initialize all metrics with default values
pub fn init_metrics() {
    for protocol in crate::transfer::TransferType::ALL {
        let label = protocol.protocol_dir();
        FRAGMENTS_RECEIVED.with_label_values(&[label]).inc_by(0.0);
        FRAGMENTS_DROPPED.with_label_values(&[label]).inc_by(0.0);
        FILES_RECONSTRUCTED.with_label_values(&[label]).inc_by(0.0);
    }
    PARTIAL_MERGES.inc_by(0.0);
    ANOMALIES.inc_by(0.0);
    ASSEMBLERS_EVICTED.inc_by(0.0);
    FILES_CARVED.inc_by(0.0);
}
