//! A minimal command line program for running an xnode.

fn main() {
    xnode::main();
}
