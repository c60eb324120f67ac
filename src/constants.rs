// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name, used as field manager prefix
pub const OPERATOR_NAME: &str = "trellis";

/// Finalizers are named `<FINALIZER_DOMAIN>/<reconciler>`
pub const FINALIZER_DOMAIN: &str = "trellis.dev";

/// Branch used when none is configured
pub const DEFAULT_BRANCH: &str = "main";

/// Kind that is created first and deleted last during convergence
pub const NAMESPACE_KIND: &str = "Namespace";

/// Work queue and worker pool tuning
pub mod queue {
    /// Workers per reconciler
    pub const DEFAULT_WORKERS: usize = 10;
    /// First backoff step for rate limited requeues, in milliseconds
    pub const BASE_DELAY_MS: u64 = 5;
    /// Backoff cap for rate limited requeues, in seconds
    pub const MAX_DELAY_SECS: u64 = 1000;
}

/// Informer watch handling
pub mod watch {
    /// Fixed delay before a failed watch is reopened, in milliseconds
    pub const RETRY_DELAY_MS: u64 = 1000;
}

/// Run-once completion detection
pub mod collector {
    /// Interval of the idle detection tick, in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 500;
    /// Idle ticks required after the last attempt finished
    pub const IDLE_TICKS: u32 = 3;
    /// Buffer of the outcome channel
    pub const CHANNEL_CAPACITY: usize = 1024;
}

/// Script runtime limits
pub mod script {
    /// Name of the function every script entrypoint must define
    pub const RECONCILE_FN: &str = "reconcile";
    /// Operation budget of one script call
    pub const MAX_OPERATIONS: u64 = 5_000_000;
    /// File extension stripped when resolving imports
    pub const EXTENSION: &str = "rhai";
}
