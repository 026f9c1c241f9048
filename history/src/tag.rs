use canopy_cas::CasDigest;

/// Orthogonal label on tags; every channel has a tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Channel {
    Trunk,
    Devel,
    Test,
    Prod,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Trunk, Channel::Devel, Channel::Test, Channel::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Trunk => "trunk",
            Channel::Devel => "devel",
            Channel::Test => "test",
            Channel::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named reference to a published root digest. Names are unique across
/// the whole history; revisions are assigned by the publisher and may be
/// shared by tags created within one publish.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tag {
    pub name: String,
    pub root_digest: CasDigest,
    pub size: u64,
    pub revision: u64,
    pub timestamp: i64,
    pub channel: Channel,
    pub description: String,
}
