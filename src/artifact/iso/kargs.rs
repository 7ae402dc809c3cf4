//! Volume identifier and live kernel command line.

use std::fmt;

/// ISO9660 volume identifiers are at most 32 characters.
pub const VOLUME_ID_MAX_LEN: usize = 32;

/// Kernel argument the live initramfs uses to find its boot medium.
pub const LIVE_ISO_KARG: &str = "coreos.liveiso";

/// Keys that only make sense for an installed system, plus the ones the
/// live boot templates already set.
pub const EXCLUDED_KARGS: &[&str] = &[
    "root",
    "rootflags",
    "rw",
    "ostree",
    "boot",
    "ignition.firstboot",
    "$ignition_firstboot",
    "console",
    "ignition.platform.id",
];

/// `<product>-<build>`, cut to the first 32 characters.
pub fn volume_id(product: &str, build_id: &str) -> String {
    format!("{product}-{build_id}")
        .chars()
        .take(VOLUME_ID_MAX_LEN)
        .collect()
}

fn key_of(token: &str) -> &str {
    token.split_once('=').map_or(token, |(key, _)| key)
}

/// Ordered kernel argument tokens for the live media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArguments {
    tokens: Vec<String>,
}

impl KernelArguments {
    /// Drop tokens whose key is in `excluded`, then append
    /// `coreos.liveiso=<volid>`.
    ///
    /// An existing `coreos.liveiso` token is replaced, so feeding the output
    /// back in yields the same list.
    pub fn filtered<I, S>(tokens: I, excluded: &[&str], volume_id: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept: Vec<String> = tokens
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .filter(|t| {
                let key = key_of(t);
                key != LIVE_ISO_KARG && !excluded.contains(&key)
            })
            .collect();
        kept.push(format!("{LIVE_ISO_KARG}={volume_id}"));
        Self { tokens: kept }
    }

    /// Live arguments from the baked-in set, with the default exclusions.
    pub fn for_live<I, S>(tokens: I, volume_id: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::filtered(tokens, EXCLUDED_KARGS, volume_id)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn to_cmdline(&self) -> String {
        self.tokens.join(" ")
    }
}

impl fmt::Display for KernelArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cmdline())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_and_append() {
        let kargs = KernelArguments::filtered(["a=1", "console=ttyS0", "b=2"], &["console"], "VOL");
        assert_eq!(kargs.tokens(), ["a=1", "b=2", "coreos.liveiso=VOL"]);
        assert_eq!(kargs.to_cmdline(), "a=1 b=2 coreos.liveiso=VOL");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let once = KernelArguments::filtered(["a=1", "console=ttyS0", "b=2"], &["console"], "VOL");
        let twice = KernelArguments::filtered(once.tokens(), &["console"], "VOL");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_default_exclusions() {
        let kargs = KernelArguments::for_live(
            [
                "rw",
                "root=UUID=1234",
                "mitigations=auto,nosmt",
                "$ignition_firstboot",
                "ignition.platform.id=metal",
                "console=tty0",
            ],
            "fedora-coreos-41",
        );
        assert_eq!(
            kargs.tokens(),
            ["mitigations=auto,nosmt", "coreos.liveiso=fedora-coreos-41"]
        );
    }

    #[test]
    fn test_live_drops_disk_console() {
        let kargs = KernelArguments::for_live(["a=1", "console=ttyS0", "b=2"], "VOL");
        assert_eq!(kargs.tokens(), ["a=1", "b=2", "coreos.liveiso=VOL"]);
        let again = KernelArguments::for_live(kargs.tokens(), "VOL");
        assert_eq!(again, kargs);
    }

    #[test]
    fn test_volume_id_truncation() {
        let id = volume_id("fedora-coreos", "41.20250101.20.0");
        assert_eq!(id, "fedora-coreos-41.20250101.20.0");

        let long = volume_id("rhcos", "417.94.202501011200-0.really.long");
        assert_eq!(long.chars().count(), VOLUME_ID_MAX_LEN);
        assert_eq!(long, "rhcos-417.94.202501011200-0.real");
        assert_eq!(long, volume_id("rhcos", "417.94.202501011200-0.really.long"));
    }
}
