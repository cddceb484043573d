use ethers::prelude::*;
use ethers::utils::keccak256;

// ERC-20 surface used for payments and faucet funding
abigen!(
    IERC20,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function balanceOf(address account) external view returns (uint256)
    ]"#
);

/// Topic 0 of `Transfer(address,address,uint256)`.
pub fn transfer_topic() -> H256 {
    H256::from(keccak256("Transfer(address,address,uint256)"))
}

/// Calldata for `transfer(to, amount)`, selector included.
pub fn transfer_calldata(to: Address, amount: U256) -> Bytes {
    use ethers::abi::AbiEncode;
    Bytes::from(TransferCall { to, amount }.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_topic_matches_known_value() {
        assert_eq!(
            format!("{:?}", transfer_topic()),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_transfer_calldata_layout() {
        let data = transfer_calldata(Address::repeat_byte(0x11), U256::from(100u64));
        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data[data.len() - 1], 100);
    }
}
