//! Orchestrator scenarios against the in-memory backend and recording
//! peers: write-through eviction, cluster queueing, retries and the
//! schema race.
