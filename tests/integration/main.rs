// Integration tests compiled as a single target.
// Everything except `connection_test::test_live_broker_round_trip` runs against the
// in-process broker.

mod connection_test;
mod helper;
mod mandatory_test;
mod publish_consume_test;
mod settlement_test;
