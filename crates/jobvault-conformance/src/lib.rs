//! Backend-independent conformance suite for [`JobStore`] implementations.
//!
//! Every case is an async function over a [`StoreFixture`] and an
//! [`ExternalStores`] registry. A backend wires the whole suite into its own
//! integration tests with one macro call:
//!
//! ```ignore
//! jobvault_conformance::conformance_suite!(MyFixture::new());
//! ```
//!
//! which expands to one `#[tokio::test]` per case (so the calling crate needs
//! `tokio` as a dev-dependency). Attributes listed after the fixture are put
//! on every generated test:
//!
//! ```ignore
//! jobvault_conformance::conformance_suite!(LiveFixture::new(), #[ignore = "needs credentials"]);
//! ```
//!
//! Each test builds a fresh fixture, runs the case and tears the external
//! resources down again.

pub mod cases;
pub mod external;
pub mod fixture;
pub mod support;

pub use external::{ExternalStores, FtpStub, HttpStub};
pub use fixture::{SUITE_INLINE_THRESHOLD, SUITE_PART_SIZE, StoreFixture};

/// Expand into one test per conformance case for the fixture built by
/// `$fixture`.
#[macro_export]
macro_rules! conformance_suite {
    ($fixture:expr $(, #[$attr:meta])* $(,)?) => {
        $crate::__conformance_cases!(
            [$(#[$attr])*] $fixture;
            jobs::job_round_trip,
            jobs::config_round_trip,
            jobs::update_isolation,
            jobs::delete_idempotent_without_cascade,
            jobs::persist_missing_job,
            jobs::job_enumeration,
            jobs::batch_creates,
            jobs::concurrent_creates,
            jobs::overlarge_job_records,
            jobs::update_atomic_for_readers,
            staged::staged_deletions_on_update,
            staged::staged_deletions_recovered,
            files::file_lifecycle,
            files::empty_files,
            files::job_owned_files_released,
            files::file_owner_must_exist,
            files::update_of_deleted_file,
            shared::shared_file_isolation,
            shared::shared_public_url,
            shared::shared_name_rules,
            stats::stats_read_and_purge,
            streams::stream_sizes,
            streams::partial_read_does_not_block,
            streams::abandoned_writer,
            streams::missing_file_streams,
            crypto::cse_toggle,
            crypto::sse_toggle,
            crypto::wrong_key,
            import::import_local,
            import::import_http,
            import::import_ftp,
            import::import_from_other_store,
            import::import_into_shared_file,
            lifecycle::destroy_idempotent,
            lifecycle::root_job_and_clean,
        );
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __conformance_cases {
    ($attrs:tt $fixture:expr; $($module:ident :: $case:ident),* $(,)?) => {
        $(
            $crate::__conformance_case!($attrs $fixture; $module :: $case);
        )*
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __conformance_case {
    ([$($attr:tt)*] $fixture:expr; $module:ident :: $case:ident) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        $($attr)*
        async fn $case() {
            let fixture = $fixture;
            let external = $crate::ExternalStores::new();
            $crate::cases::$module::$case(&fixture, &external).await;
            external.teardown().await;
        }
    };
}
