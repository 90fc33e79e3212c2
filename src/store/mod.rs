//! External stores: room tokens and match results

pub mod results;
pub mod supabase;
pub mod tokens;

pub use results::{
    run_result_worker, LogResultSink, MatchResult, ResultPublisher, ResultSink, SupabaseResultSink,
};
pub use supabase::{SupabaseClient, SupabaseError};
pub use tokens::{MemoryTokenStore, StoreError, SupabaseTokenStore, TokenStore};
