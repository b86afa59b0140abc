/// Collector module
///
/// This module groups all logic responsible for:
/// - Running one collection cycle across every configured source
/// - Pacing cycles and recovering from failed ones
///
/// The collector layer acts as the orchestration layer between:
/// - Source clients (price feed, block explorer, DeFi metrics, …)
/// - The delivery sink (redis stream, bulk ingest, master WebSocket)
///
/// Design notes:
/// - API-specific logic MUST NOT live here
/// - Cycles are strictly sequential; only sources run concurrently
/// - No error escapes the loop after startup
pub mod orchestrator;
pub mod runner;
