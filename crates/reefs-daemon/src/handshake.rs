// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Driver identity check performed once before serving

use reefs_proto::TeeIoctlVersionData;
use tracing::{error, info};

use crate::error::TransportError;
use crate::transport::Transport;

/// Query the driver and accept it only if it is the expected backend.
pub fn verify_version<T: Transport + ?Sized>(
    transport: &mut T,
    expected_impl_id: u32,
) -> Result<TeeIoctlVersionData, TransportError> {
    let version = transport.version()?;
    if version.impl_id != expected_impl_id {
        error!(
            impl_id = version.impl_id,
            expected = expected_impl_id,
            "TEE driver is not the expected implementation"
        );
        return Err(TransportError::VersionMismatch {
            found: version.impl_id,
            expected: expected_impl_id,
        });
    }
    info!(
        impl_id = version.impl_id,
        impl_caps = version.impl_caps,
        gen_caps = version.gen_caps,
        "TEE driver version verified"
    );
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use reefs_proto::TEE_IMPL_ID_MBEDTEE;

    #[test]
    fn matching_implementation_is_accepted() {
        let mut transport = MockTransport::new();
        transport.expect_version().times(1).returning(|| {
            Ok(TeeIoctlVersionData {
                impl_id: TEE_IMPL_ID_MBEDTEE,
                impl_caps: 0,
                gen_caps: 3,
            })
        });

        let version = verify_version(&mut transport, TEE_IMPL_ID_MBEDTEE).unwrap();
        assert_eq!(version.gen_caps, 3);
    }

    #[test]
    fn foreign_implementation_is_rejected() {
        let mut transport = MockTransport::new();
        transport.expect_version().returning(|| {
            Ok(TeeIoctlVersionData {
                impl_id: 1,
                ..Default::default()
            })
        });

        let err = verify_version(&mut transport, TEE_IMPL_ID_MBEDTEE).unwrap_err();
        assert!(matches!(
            err,
            TransportError::VersionMismatch {
                found: 1,
                expected: TEE_IMPL_ID_MBEDTEE
            }
        ));
    }
}
