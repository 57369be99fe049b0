use sha1::Digest;

#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Sha1(pub [u8; 20]);

impl Sha1 {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = sha1::Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn from_hex(str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0; 20];
        hex::decode_to_slice(str, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha1({})", hex::encode(self.0))
    }
}
