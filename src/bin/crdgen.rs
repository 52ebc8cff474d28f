//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the resource records
//! persisted by the Kubernetes store backend.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use control_plane_reconciler::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
