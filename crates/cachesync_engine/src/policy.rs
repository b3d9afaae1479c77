//! Store types and the read/write policies they imply.

/// How a data store balances the local cache against the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreType {
    /// Offline-first: reads and writes stay local until pushed or pulled.
    Sync,
    /// Cached: reads return the network result and refresh the cache,
    /// writes go local first and are pushed immediately.
    #[default]
    Cache,
    /// No cache: every call goes to the network.
    Network,
    /// Network first, falling back to the cache when offline.
    Auto,
}

impl StoreType {
    /// Default read policy.
    pub fn read_policy(self) -> ReadPolicy {
        match self {
            Self::Sync => ReadPolicy::ForceLocal,
            Self::Cache => ReadPolicy::Both,
            Self::Network => ReadPolicy::ForceNetwork,
            Self::Auto => ReadPolicy::NetworkOtherwiseLocal,
        }
    }

    /// Default write policy.
    pub fn write_policy(self) -> WritePolicy {
        match self {
            Self::Sync => WritePolicy::ForceLocal,
            Self::Cache | Self::Auto => WritePolicy::LocalThenNetwork,
            Self::Network => WritePolicy::ForceNetwork,
        }
    }

    /// True when the store keeps a local cache and a pending queue.
    pub fn has_cache(self) -> bool {
        !matches!(self, Self::Network)
    }
}

/// Where reads are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadPolicy {
    /// Cache only.
    ForceLocal,
    /// Network only; results are merged into the cache when there is one.
    ForceNetwork,
    /// Cache and network. Blocking calls return the network result; async
    /// calls deliver the cached result first.
    Both,
    /// Network, falling back to the cache on transport errors and timeouts.
    NetworkOtherwiseLocal,
}

impl ReadPolicy {
    /// True when the policy contacts the network.
    pub fn uses_network(self) -> bool {
        !matches!(self, Self::ForceLocal)
    }
}

/// Where writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePolicy {
    /// Cache plus pending queue; pushed later.
    ForceLocal,
    /// Network only; nothing is queued.
    ForceNetwork,
    /// Cache plus pending queue, then an immediate push of the mutation.
    LocalThenNetwork,
}

impl WritePolicy {
    /// True when the policy contacts the network.
    pub fn uses_network(self) -> bool {
        !matches!(self, Self::ForceLocal)
    }
}
