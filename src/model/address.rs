use serde::{Deserialize, Serialize};
use std::fmt;

/// Signing policy inferred from an address or script.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureType {
    SingleSig,
    MultiSig,
    Unknown,
}

/// Script template inferred from an address prefix or a scriptPubKey byte pattern.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq)]
pub enum ScriptType {
    // Address forms
    Taproot,
    NativeSegwit,
    P2sh,
    Legacy,

    // Script forms
    P2pkh,
    P2wpkh,
    P2wsh,
    BareMultisig,

    Unknown,
}

/// Best-effort description of an address.
///
/// This is derived data. It is recomputed from the address or script whenever it is needed and is
/// never stored as a source of truth.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct AddressInfo {
    pub address: String,
    #[serde(rename = "type")]
    pub signature_type: SignatureType,
    pub script_type: ScriptType,
    pub is_input: bool,
    pub is_output: bool,
}

impl ScriptType {
    /// Human readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Taproot => "Taproot",
            Self::NativeSegwit => "Native SegWit",
            Self::P2sh => "P2SH",
            Self::Legacy => "Legacy",
            Self::P2pkh => "P2PKH",
            Self::P2wpkh => "P2WPKH",
            Self::P2wsh => "P2WSH",
            Self::BareMultisig => "MultiSig",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl AddressInfo {
    /// Mark this address as seen on the input side of a transaction.
    pub fn as_input(mut self) -> Self {
        self.is_input = true;
        self
    }

    /// Mark this address as seen on the output side of a transaction.
    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }
}

/// Classify a mainnet address string by its prefix.
///
/// `3...` addresses are reported as multisig because P2SH commonly wraps a multisig script, but
/// nothing guarantees it. Anything unrecognized is [`SignatureType::Unknown`].
pub fn classify_address(address: &str) -> AddressInfo {
    let (signature_type, script_type) = if address.starts_with("bc1p") {
        (SignatureType::MultiSig, ScriptType::Taproot)
    } else if address.starts_with("bc1q") {
        (SignatureType::SingleSig, ScriptType::NativeSegwit)
    } else if address.starts_with('3') {
        (SignatureType::MultiSig, ScriptType::P2sh)
    } else if address.starts_with('1') {
        (SignatureType::SingleSig, ScriptType::Legacy)
    } else {
        (SignatureType::Unknown, ScriptType::Unknown)
    };

    AddressInfo {
        address: address.to_string(),
        signature_type,
        script_type,
        is_input: false,
        is_output: false,
    }
}

/// Classify a scriptPubKey given as a hex string by its leading and trailing opcodes.
///
/// Matching is case-insensitive. Never fails.
pub fn classify_script(script_hex: &str) -> AddressInfo {
    let script = script_hex.to_ascii_lowercase();

    let (signature_type, script_type) = if script.starts_with("76a914") && script.ends_with("88ac")
    {
        (SignatureType::SingleSig, ScriptType::P2pkh)
    } else if script.starts_with("a914") && script.ends_with("87") {
        (SignatureType::MultiSig, ScriptType::P2sh)
    } else if script.starts_with("0014") {
        (SignatureType::SingleSig, ScriptType::P2wpkh)
    } else if script.starts_with("0020") {
        (SignatureType::MultiSig, ScriptType::P2wsh)
    } else if ["5121", "5221", "5321"]
        .iter()
        .any(|prefix| script.starts_with(prefix))
    {
        (SignatureType::MultiSig, ScriptType::BareMultisig)
    } else {
        (SignatureType::Unknown, ScriptType::Unknown)
    };

    AddressInfo {
        address: script_hex.to_string(),
        signature_type,
        script_type,
        is_input: false,
        is_output: false,
    }
}

/// Coarse address family name, as shown next to wallet addresses.
pub fn address_kind(address: &str) -> &'static str {
    match classify_address(address).script_type {
        ScriptType::Legacy => "legacy",
        ScriptType::P2sh => "segwit",
        ScriptType::NativeSegwit => "native-segwit",
        ScriptType::Taproot => "taproot",
        _ => "unknown",
    }
}
