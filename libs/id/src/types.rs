//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// Identity of a submitted infrastructure.
    ///
    /// Assigned once, when the infrastructure description is compiled, and
    /// used as the sole key for its description, dynamic state and
    /// supervision record.
    InfraId,
    "infra"
);

define_id!(
    /// Identity of one provisioned instance of an infrastructure node.
    NodeInstanceId,
    "ni"
);
