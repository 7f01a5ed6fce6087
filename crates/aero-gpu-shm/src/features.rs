use bitflags::bitflags;

bitflags! {
    /// Capability bits advertised in the control region and negotiated during the handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u64 {
        /// Baseline rendering support. Every usable peer must advertise it.
        const BASELINE = 1 << 0;
        const RESOURCE_HEAP = 1 << 1;
        const FENCE_IRQ = 1 << 2;
        const DISPLAY_MODE = 1 << 3;
        const DOORBELL_COALESCING = 1 << 4;
    }
}

impl Features {
    /// Bits without which the channel cannot operate.
    pub const REQUIRED: Self = Self::BASELINE;

    /// Assumed when a peer advertises nothing at all (an empty handshake acknowledgement).
    pub const MINIMUM_VIABLE: Self = Self::BASELINE;

    /// Everything this build understands.
    pub const SUPPORTED: Self = Self::all();

    pub fn has_required(self) -> bool {
        self.contains(Self::REQUIRED)
    }

    /// Intersection of what the responder offers and what the initiator supports.
    pub fn negotiate(offered: Self, supported: Self) -> Self {
        offered & supported
    }
}

impl Default for Features {
    fn default() -> Self {
        Self::SUPPORTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_viable_set_is_usable() {
        assert!(Features::MINIMUM_VIABLE.has_required());
        assert!(!Features::RESOURCE_HEAP.has_required());
    }

    #[test]
    fn negotiation_intersects() {
        let offered = Features::BASELINE | Features::FENCE_IRQ | Features::DISPLAY_MODE;
        let supported = Features::BASELINE | Features::FENCE_IRQ;
        assert_eq!(
            Features::negotiate(offered, supported),
            Features::BASELINE | Features::FENCE_IRQ
        );
    }

    #[test]
    fn unknown_bits_are_kept_when_retained() {
        let raw = Features::BASELINE.bits() | (1 << 40);
        let features = Features::from_bits_retain(raw);
        assert_eq!(features.bits(), raw);
        assert_eq!(Features::negotiate(features, Features::SUPPORTED), Features::BASELINE);
    }
}
