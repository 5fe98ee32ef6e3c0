use std::collections::HashMap;

use itx_common::models::{address::AddressParam, internal_transaction::InternalTransaction, Address};

/// Unique addresses touched by the internal transactions, in order of first appearance.
///
/// Each address carries the highest block it was seen in, so its coin balance is refreshed as of
/// that block. Created contracts carry their code.
pub fn extract(itxs: &[InternalTransaction]) -> Vec<AddressParam> {
    let mut positions: HashMap<Address, usize> = HashMap::new();
    let mut result: Vec<AddressParam> = Vec::new();
    let mut add = |param: AddressParam| match positions.get(&param.hash) {
        Some(&pos) => result[pos].merge(param),
        None => {
            positions.insert(param.hash, result.len());
            result.push(param);
        }
    };

    for itx in itxs {
        add(AddressParam::new(itx.from_address_hash, itx.block_number));
        if let Some(to) = itx.to_address_hash {
            add(AddressParam::new(to, itx.block_number));
        }
        if let Some(created) = itx.created_contract_address_hash {
            let mut param = AddressParam::new(created, itx.block_number);
            param.contract_code = itx.created_contract_code.clone();
            add(param);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use itx_common::models::{internal_transaction::fixtures::call, Bytes, TxHash};

    use super::*;

    #[test]
    fn test_extract_merges_by_hash() {
        let tx = TxHash::repeat_byte(1);
        let first = call(tx, &[]);
        let mut later = call(tx, &[0]);
        later.block_number = 105;
        later.to_address_hash = None;
        later.created_contract_address_hash = Some(Address::repeat_byte(0x33));
        later.created_contract_code = Some(Bytes::from_static(&[0x60]));

        let addresses = extract(&[first, later]);

        assert_eq!(
            addresses,
            vec![
                AddressParam::new(Address::repeat_byte(0x11), 105),
                AddressParam::new(Address::repeat_byte(0x22), 100),
                AddressParam::new(Address::repeat_byte(0x33), 105)
                    .with_contract_code(Bytes::from_static(&[0x60])),
            ]
        );
    }
}
