//! Compile time configurations for the util crate
fn main() {
    // the AGENT_PKG_NAME variable names the systemd units, MQTT client ids and
    // the virtual device driver. Units installed by older packages use this
    // name, do not change it unless they are migrated too.
    println!("cargo::rustc-env=AGENT_PKG_NAME=wb-cloud-agent");
}
