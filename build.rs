use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

//HP_SCAN_THRESHOLD

fn main() {
    println!("cargo:rerun-if-env-changed=HP_SCAN_THRESHOLD");

    let out_dir = env::var("OUT_DIR").expect("no out directory");
    let dest = Path::new(&out_dir).join("build_constants.rs");

    let mut file = File::create(&dest).expect("could not create file");

    // the paper calls this constant `R`: the minimum number of pending
    // retired pointers before a thread attempts a reclamation scan. 0
    // scans on every retire, which is what the reference implementation
    // hard-codes; larger values amortize the scan cost under heavy churn.
    let scan: u32 = option_env!("HP_SCAN_THRESHOLD")
        .map_or(Ok(0), str::parse)
        .expect("failed to parse env variable HP_SCAN_THRESHOLD");

    write!(&mut file, "const DEFAULT_SCAN_THRESHOLD: u32 = {};", scan).expect("could not write to file");
}
