//! Network and asset definitions, plus known token deployments.
//!
//! This module defines the ledger networks a subscription can target and
//! provides statically known USDC mints per network.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use solana_pubkey::{Pubkey, pubkey};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

/// Supported Solana networks.
///
/// Used to differentiate between mainnet and devnet environments when
/// polling accounts and attributing observed transactions.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Solana mainnet-beta.
    #[serde(rename = "mainnet")]
    Mainnet,
    /// Solana devnet.
    #[serde(rename = "devnet")]
    Devnet,
}

impl Network {
    /// Return the canonical lowercase name of the network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Devnet => "devnet",
        }
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::Mainnet, Network::Devnet]
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UnknownNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "mainnet-beta" => Ok(Network::Mainnet),
            "devnet" => Ok(Network::Devnet),
            other => Err(UnknownNetworkError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct UnknownNetworkError(pub String);

/// The kind of asset a subscription observes.
///
/// Native subscriptions watch the wallet account itself; fungible-token
/// subscriptions watch the associated token account for a specific mint.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Native,
    FungibleToken,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Native => "native",
            AssetKind::FungibleToken => "fungible_token",
        }
    }
}

impl Display for AssetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = UnknownAssetKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(AssetKind::Native),
            "fungible_token" => Ok(AssetKind::FungibleToken),
            other => Err(UnknownAssetKindError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown asset kind: {0}")]
pub struct UnknownAssetKindError(pub String);

/// The SPL associated-token-account program.
pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Derive the associated token account for `wallet` holding `mint`.
///
/// This is the account actually polled for fungible-token subscriptions.
pub fn associated_token_account(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    let (ata, _) = Pubkey::find_program_address(
        &[wallet.as_ref(), spl_token::ID.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_PUBKEY,
    );
    ata
}

/// Lazily initialized known USDC mint on mainnet.
static USDC_MAINNET: Lazy<UsdcMint> = Lazy::new(|| {
    UsdcMint(pubkey!("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"))
});

/// Lazily initialized known USDC mint on devnet.
static USDC_DEVNET: Lazy<UsdcMint> = Lazy::new(|| {
    UsdcMint(pubkey!("4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU"))
});

/// A known USDC mint as a wrapper around [`Pubkey`].
#[derive(Clone, Debug)]
pub struct UsdcMint(pub Pubkey);

impl Deref for UsdcMint {
    type Target = Pubkey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl UsdcMint {
    /// Return the known USDC mint for the given network.
    pub fn by_network<N: Borrow<Network>>(network: N) -> &'static UsdcMint {
        match network.borrow() {
            Network::Mainnet => &USDC_MAINNET,
            Network::Devnet => &USDC_DEVNET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_round_trip() {
        for network in Network::variants() {
            let parsed: Network = network.as_str().parse().unwrap();
            assert_eq!(parsed, *network);
        }
        assert!("testnet".parse::<Network>().is_err());
    }

    #[test]
    fn asset_kind_round_trip() {
        assert_eq!("native".parse::<AssetKind>().unwrap(), AssetKind::Native);
        assert_eq!(
            "fungible_token".parse::<AssetKind>().unwrap(),
            AssetKind::FungibleToken
        );
        assert!("nft".parse::<AssetKind>().is_err());
    }

    #[test]
    fn usdc_mint_by_network() {
        assert_eq!(
            UsdcMint::by_network(Network::Mainnet).to_string(),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
        );
        assert_ne!(
            UsdcMint::by_network(Network::Mainnet).0,
            UsdcMint::by_network(Network::Devnet).0
        );
    }

    #[test]
    fn ata_derivation_is_deterministic() {
        let wallet = pubkey!("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");
        let mint = UsdcMint::by_network(Network::Devnet).0;
        let a = associated_token_account(&wallet, &mint);
        let b = associated_token_account(&wallet, &mint);
        assert_eq!(a, b);
        assert_ne!(a, wallet);
    }
}
