use digest::{Digest, DynDigest};
use serde::{Deserialize, Serialize};

use sha2::Sha256;
use sha2::Sha512;

use crate::{Error, Result};

// https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OciDigest {
    algorithm: RegisteredImageSpecAlgorithm,
    encoded: String,
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let invalid = || Error::DigestInvalid(Some(s.to_string()));
        let (algo, encoded) = s.split_once(':').ok_or_else(invalid)?;
        let algorithm = RegisteredImageSpecAlgorithm::try_from(algo).map_err(|_| invalid())?;

        if encoded.len() != algorithm.encoded_len()
            || !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(invalid());
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }
}

impl TryFrom<String> for OciDigest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        OciDigest::try_from(s.as_str())
    }
}

impl std::str::FromStr for OciDigest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        OciDigest::try_from(s)
    }
}

/// The sha256 digest of the given bytes.
impl From<&[u8]> for OciDigest {
    fn from(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, bs);
        let s = hasher.finalize();

        Self {
            algorithm: RegisteredImageSpecAlgorithm::Sha256,
            encoded: format!("{:x}", s),
        }
    }
}

impl From<OciDigest> for String {
    fn from(d: OciDigest) -> String {
        String::from(&d)
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        format!("{}:{}", d.algorithm.as_str(), d.encoded)
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.encoded)
    }
}

impl OciDigest {
    pub fn algorithm(&self) -> &'static str {
        self.algorithm.as_str()
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// A fresh [`Digester`] using this digest's algorithm.
    pub fn digester(&self) -> Digester {
        Digester::new(self.algorithm.clone())
    }

    /// Whether `bytes` hash to this digest.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        let mut digester = self.digester();
        digester.update(bytes);
        &digester.finalize() == self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum RegisteredImageSpecAlgorithm {
    Sha256,
    Sha512,
}

impl TryFrom<&str> for RegisteredImageSpecAlgorithm {
    type Error = Error;

    fn try_from(a: &str) -> Result<Self> {
        match a {
            "sha512" => Ok(RegisteredImageSpecAlgorithm::Sha512),
            "sha256" => Ok(RegisteredImageSpecAlgorithm::Sha256),
            s => Err(Error::DigestInvalid(Some(format!(
                "unsupported digest algorithm: {s}"
            )))),
        }
    }
}

impl RegisteredImageSpecAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            RegisteredImageSpecAlgorithm::Sha512 => "sha512",
            RegisteredImageSpecAlgorithm::Sha256 => "sha256",
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            RegisteredImageSpecAlgorithm::Sha512 => 128,
            RegisteredImageSpecAlgorithm::Sha256 => 64,
        }
    }
}

/// Incremental digest calculation over a sequence of byte slices.
pub struct Digester {
    algorithm: RegisteredImageSpecAlgorithm,
    digester: Box<dyn DynDigest + 'static + Send>,
    bytes: u64,
}

impl Digester {
    fn new(algorithm: RegisteredImageSpecAlgorithm) -> Self {
        let digester: Box<dyn DynDigest + 'static + Send> = match algorithm {
            RegisteredImageSpecAlgorithm::Sha256 => Box::new(Sha256::new()),
            RegisteredImageSpecAlgorithm::Sha512 => Box::new(Sha512::new()),
        };
        Self {
            algorithm,
            digester,
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digester.update(data);
        self.bytes += data.len() as u64;
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> OciDigest {
        let encoded = self
            .digester
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        OciDigest {
            algorithm: self.algorithm,
            encoded,
        }
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new(RegisteredImageSpecAlgorithm::Sha256)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[rstest]
    #[case::sha256(&format!("sha256:{EMPTY_SHA256}"), Ok(OciDigest {
        algorithm: RegisteredImageSpecAlgorithm::Sha256,
        encoded: String::from(EMPTY_SHA256),
    }))]
    #[case::sha512(&format!("sha512:{}", "a".repeat(128)), Ok(OciDigest {
        algorithm: RegisteredImageSpecAlgorithm::Sha512,
        encoded: "a".repeat(128),
    }))]
    #[case::unknown_algorithm("sha666:meow", Err(Error::DigestInvalid(Some(String::from("sha666:meow")))))]
    #[case::missing_separator("sha256meow", Err(Error::DigestInvalid(Some(String::from("sha256meow")))))]
    #[case::empty_encoded("sha256:", Err(Error::DigestInvalid(Some(String::from("sha256:")))))]
    #[case::empty_algorithm(":meow", Err(Error::DigestInvalid(Some(String::from(":meow")))))]
    #[case::not_hex("sha256:meow", Err(Error::DigestInvalid(Some(String::from("sha256:meow")))))]
    #[case::uppercase(
        &format!("sha256:{}", EMPTY_SHA256.to_uppercase()),
        Err(Error::DigestInvalid(Some(format!("sha256:{}", EMPTY_SHA256.to_uppercase()))))
    )]
    fn validate_try_from(#[case] input: &str, #[case] expected: Result<OciDigest>) {
        let actual: Result<OciDigest> = input.try_into();
        match (expected, actual) {
            (Ok(exp), Ok(act)) => {
                assert_eq!(exp, act);
            }
            (Ok(s), Err(e)) => {
                assert!(false, "expected Ok( {s:?} ) got Err( {e:?} )");
            }
            (Err(exp), Err(act)) => {
                let exp = format!("{exp}");
                let act = format!("{act}");
                assert_eq!(exp, act);
            }
            (Err(e), Ok(s)) => {
                assert!(false, "expected Err( {e:?} ) got Ok( {s:?} )");
            }
        }
    }

    #[test]
    fn digest_of_bytes() {
        let d = OciDigest::from(&b""[..]);
        assert_eq!(String::from(&d), format!("sha256:{EMPTY_SHA256}"));
    }

    #[rstest]
    #[case::whole(vec![&b"abcd"[..]])]
    #[case::split(vec![&b"ab"[..], &b"cd"[..]])]
    #[case::bytewise(vec![&b"a"[..], &b"b"[..], &b"c"[..], &b"d"[..]])]
    fn digester_is_incremental(#[case] parts: Vec<&[u8]>) {
        let expected = OciDigest::from(&b"abcd"[..]);
        let mut digester = expected.digester();
        for p in parts {
            digester.update(p);
        }
        assert_eq!(digester.bytes(), 4);
        assert_eq!(digester.finalize(), expected);
    }

    #[test]
    fn matches_checks_algorithm_of_claim() {
        let mut digester = OciDigest::try_from(format!("sha512:{}", "0".repeat(128)).as_str())
            .unwrap()
            .digester();
        digester.update(b"abcd");
        let sha512 = digester.finalize();
        assert_eq!(sha512.algorithm(), "sha512");
        assert!(sha512.matches(b"abcd"));
        assert!(!sha512.matches(b"abce"));
    }

    #[test]
    fn serde_as_string() {
        let d = OciDigest::from(&b""[..]);
        let s = serde_json::to_string(&d).unwrap();
        assert_eq!(s, format!("\"sha256:{EMPTY_SHA256}\""));
        let back: OciDigest = serde_json::from_str(&s).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<OciDigest>("\"sha256:nope\"").is_err());
    }
}
