//! kubeadm join-command extraction.
//!
//! `kubeadm init` prints the join invocations for additional control
//! planes and for workers as free text, folded over several lines with
//! trailing backslashes. Three expressions pick the fragments out of the
//! transcript; missing fragments degrade to empty strings and are left
//! for the eventual join execution to reject.

use std::sync::OnceLock;

use regex::Regex;

/// Join commands recovered from a `kubeadm init` transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCommands {
    /// `kubeadm join … --control-plane --certificate-key …`
    pub control_plane: String,
    /// `kubeadm join …` without the control-plane fragment.
    pub worker: String,
}

fn endpoint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"kubeadm\sjoin\s(.*?)\s--token\s(.*?)\n").unwrap())
}

fn cert_hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--discovery-token-ca-cert-hash\ssha256:(.*?)\n").unwrap())
}

fn cert_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--control-plane --certificate-key(.*?)\n").unwrap())
}

/// Strip the line-folding a fragment was printed with.
fn fragment(m: Option<regex::Match<'_>>) -> String {
    m.map(|m| m.as_str())
        .unwrap_or_default()
        .trim()
        .trim_end_matches('\\')
        .trim()
        .to_string()
}

/// Parse the raw stdout of `kubeadm init` into the two join commands.
///
/// The first match of each expression wins. A transcript missing the
/// certificate-key line still yields a usable worker command; the
/// control-plane command then carries a trailing empty fragment.
#[must_use]
pub fn parse_join_commands(init_output: &str) -> JoinCommands {
    let endpoint = fragment(endpoint_re().find(init_output));
    let cert_hash = fragment(cert_hash_re().find(init_output));
    let cert_key = fragment(cert_key_re().find(init_output));

    JoinCommands {
        control_plane: format!("{endpoint} {cert_hash} {cert_key}"),
        worker: format!("{endpoint} {cert_hash}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_TRANSCRIPT: &str = "\
[init] Using Kubernetes version: v1.23.13
...
Your Kubernetes control-plane has initialized successfully!

You can now join any number of control-plane nodes by copying certificate authorities
and service account keys on each node and then running the following as root:

  kubeadm join 10.0.4.12:6443 --token u4h0xq.el3behz9t2b40y4o \\
\t--discovery-token-ca-cert-hash sha256:8d0c3b2ab4b4f5e63c9e5f1a0c9a67f0b5f1e54c6ff0d5ee9c8e07d6a3c8b1aa \\
\t--control-plane --certificate-key 70eb87e62f052d2d5de759969d5b42f372d0730581ce4de12e78ddbca229edb9

Then you can join any number of worker nodes by running the following on each as root:

kubeadm join 10.0.4.12:6443 --token u4h0xq.el3behz9t2b40y4o \\
\t--discovery-token-ca-cert-hash sha256:8d0c3b2ab4b4f5e63c9e5f1a0c9a67f0b5f1e54c6ff0d5ee9c8e07d6a3c8b1aa
";

    #[test]
    fn test_parse_full_transcript() {
        let cmds = parse_join_commands(INIT_TRANSCRIPT);

        assert_eq!(
            cmds.worker,
            "kubeadm join 10.0.4.12:6443 --token u4h0xq.el3behz9t2b40y4o \
             --discovery-token-ca-cert-hash sha256:8d0c3b2ab4b4f5e63c9e5f1a0c9a67f0b5f1e54c6ff0d5ee9c8e07d6a3c8b1aa"
        );
        assert!(cmds.control_plane.starts_with(&cmds.worker));
        assert!(cmds
            .control_plane
            .contains("--control-plane --certificate-key 70eb87e62f052d2d5de759969d5b42f372d0730581ce4de12e78ddbca229edb9"));
        assert!(!cmds.worker.contains("--control-plane"));
    }

    #[test]
    fn test_missing_certificate_key_line() {
        let transcript = INIT_TRANSCRIPT
            .lines()
            .filter(|l| !l.contains("--certificate-key"))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        let cmds = parse_join_commands(&transcript);

        // worker command survives; cp command ends in an empty fragment
        assert!(cmds.worker.contains("--token"));
        assert!(cmds.worker.contains("--discovery-token-ca-cert-hash"));
        assert!(cmds.control_plane.ends_with(' '));
        assert!(!cmds.control_plane.contains("--certificate-key"));
    }

    #[test]
    fn test_empty_input() {
        let cmds = parse_join_commands("");
        assert_eq!(cmds.worker, " ");
        assert_eq!(cmds.control_plane, "  ");
    }
}
