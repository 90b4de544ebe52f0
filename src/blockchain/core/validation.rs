use crate::blockchain::core::chain::{Block, BlockHeader, Sha256Hash};
use crate::error::ChainError;

/// Structural checks on a block that do not need chain context.
pub fn validate_block_body(block: &Block) -> Result<(), ChainError> {
    let expected_merkle_root = Block::calculate_merkle_root(&block.transactions);
    if expected_merkle_root != block.header.merkle_root {
        return Err(ChainError::InvalidMerkleRoot);
    }
    if block.transactions.is_empty() {
        return Err(ChainError::InvalidBlock("Block carries no transactions.".to_string()));
    }
    Ok(())
}

/// Check that `header` directly extends the block `(parent_hash, parent_height)`.
pub fn validate_header_linkage(
    header: &BlockHeader,
    parent_hash: &Sha256Hash,
    parent_height: u64,
) -> Result<(), ChainError> {
    if header.previous_hash != *parent_hash {
        return Err(ChainError::InvalidBlockLinkage);
    }
    let expected = parent_height
        .checked_add(1)
        .ok_or_else(|| ChainError::InvalidBlock(format!("Parent height {} has no successor.", parent_height)))?;
    if header.height != expected {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block height. Expected {}, but got {}.",
            expected, header.height
        )));
    }
    Ok(())
}

/// Check that a run of headers forms a single chain, each one extending the
/// previous.
pub fn validate_header_sequence(headers: &[BlockHeader]) -> Result<(), ChainError> {
    for pair in headers.windows(2) {
        validate_header_linkage(&pair[1], &pair[0].hash(), pair[0].height)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_with_tampered_merkle_root_is_rejected() {
        let mut block = Block::child_of(&Block::genesis(), vec![b"tx".to_vec()]);
        block.transactions.push(b"smuggled".to_vec());
        assert_eq!(validate_block_body(&block), Err(ChainError::InvalidMerkleRoot));
    }

    #[test]
    fn test_header_sequence_detects_gap() {
        let genesis = Block::genesis();
        let b1 = Block::child_of(&genesis, vec![b"1".to_vec()]);
        let b2 = Block::child_of(&b1, vec![b"2".to_vec()]);
        let b3 = Block::child_of(&b2, vec![b"3".to_vec()]);

        assert!(validate_header_sequence(&[b1.header.clone(), b2.header.clone(), b3.header.clone()]).is_ok());
        assert_eq!(
            validate_header_sequence(&[b1.header.clone(), b3.header.clone()]),
            Err(ChainError::InvalidBlockLinkage)
        );
    }

    #[test]
    fn test_header_linkage_checks_height() {
        let genesis = Block::genesis();
        let mut b1 = Block::child_of(&genesis, vec![b"1".to_vec()]);
        b1.header.height = 5;
        assert!(matches!(
            validate_header_linkage(&b1.header, &genesis.hash(), 0),
            Err(ChainError::InvalidBlock(_))
        ));
    }

    #[test]
    fn test_header_linkage_at_max_height_is_rejected() {
        let genesis = Block::genesis();
        let mut top = Block::child_of(&genesis, vec![b"top".to_vec()]);
        top.header.height = u64::MAX;
        let next = Block::new(0, top.hash(), top.header.timestamp, vec![b"next".to_vec()]);

        assert!(matches!(
            validate_header_linkage(&next.header, &top.hash(), u64::MAX),
            Err(ChainError::InvalidBlock(_))
        ));
        assert!(matches!(
            validate_header_sequence(&[top.header.clone(), next.header.clone()]),
            Err(ChainError::InvalidBlock(_))
        ));
    }
}
