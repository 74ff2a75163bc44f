//! Protocol implementations.

pub mod resync;
pub mod stk500;

// Re-export common types
pub use resync::{ResyncBuffer, SharedResyncBuffer};
pub use stk500::{ACK, Command, Stk500, SyncPolicy, Timeouts};

/// Format bytes as space-separated hex for wire tracing.
pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_bytes() {
        assert_eq!(hex_bytes(&[0x14, 0x10, 0x0A]), "14 10 0A");
        assert_eq!(hex_bytes(&[]), "");
    }
}
