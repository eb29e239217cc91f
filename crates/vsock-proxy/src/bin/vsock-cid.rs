//! `vsock-cid` — print the local vsock context identifier.

fn main() {
    println!("{}", common::cid::describe(common::cid::local_cid()));
}
