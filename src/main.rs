//! DFE session client - Main entry point
//!
//! This crate drives a dataflow accelerator engine (DFE) exposed over a
//! framed RPC service, and ships a reference service that simulates one.
//!
//! ## Session flow
//!
//! Every example follows the same shape:
//! 1. Allocate remote buffers and upload the inputs
//! 2. Stage data through LMem or bind it to streams with action descriptors
//! 3. Run the actions (or a single `compute` call) on a loaded engine
//! 4. Download the output and check it against a CPU reference
//! 5. Release everything that was acquired
//!
//! ## Usage
//!
//! Start the service:
//! ```bash
//! cargo run --bin dfe-server -- --listen-addr 0.0.0.0:9090
//! ```
//!
//! Run the examples:
//! ```bash
//! cargo run --bin dfe-client
//! cargo run --bin dfe-client -- --size 1024 lmem-loopback
//! cargo run --bin dfe-client -- --json moving-average
//! ```

fn main() {
    println!("DFE session client");
    println!();
    println!("Use the following binaries:");
    println!("  cargo run --bin dfe-server -- --help");
    println!("  cargo run --bin dfe-client -- --help");
}
