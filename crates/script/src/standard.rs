//! Recognized output script templates and signature-operation counting.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Largest standard input script: a 3-of-3 multisig redemption.
pub const MAX_STANDARD_SIG_SCRIPT_SIZE: usize = 500;
/// Data carrier limit for OP_RETURN outputs.
pub const MAX_NULL_DATA_SIZE: usize = 80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
    NullData,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Element {
    Op(u8),
    Push(Vec<u8>),
}

fn parse_elements(script: &[u8]) -> Option<Vec<Element>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let opcode = script[pos];
        pos += 1;
        match opcode {
            1..=0x4b => {
                let len = opcode as usize;
                let data = script.get(pos..pos + len)?;
                out.push(Element::Push(data.to_vec()));
                pos += len;
            }
            OP_PUSHDATA1 => {
                let len = *script.get(pos)? as usize;
                pos += 1;
                let data = script.get(pos..pos + len)?;
                out.push(Element::Push(data.to_vec()));
                pos += len;
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(pos..pos + 2)?;
                let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                pos += 2;
                let data = script.get(pos..pos + len)?;
                out.push(Element::Push(data.to_vec()));
                pos += len;
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(pos..pos + 4)?;
                let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                pos += 4;
                let data = script.get(pos..pos + len)?;
                out.push(Element::Push(data.to_vec()));
                pos += len;
            }
            OP_0 => out.push(Element::Push(Vec::new())),
            other => out.push(Element::Op(other)),
        }
    }
    Some(out)
}

fn small_int(op: u8) -> Option<usize> {
    if (OP_1..=OP_16).contains(&op) {
        Some((op - OP_1 + 1) as usize)
    } else {
        None
    }
}

fn is_pubkey(data: &[u8]) -> bool {
    matches!(data.len(), 33 | 65)
}

/// Classifies an output script into a recognized template, returning the
/// extracted solution data (pubkeys or hashes).
pub fn classify(script: &[u8]) -> Option<(ScriptType, Vec<Vec<u8>>)> {
    let elements = parse_elements(script)?;

    match elements.as_slice() {
        [Element::Push(pubkey), Element::Op(OP_CHECKSIG)] if is_pubkey(pubkey) => {
            Some((ScriptType::PubKey, vec![pubkey.clone()]))
        }
        [Element::Op(OP_DUP), Element::Op(OP_HASH160), Element::Push(hash), Element::Op(OP_EQUALVERIFY), Element::Op(OP_CHECKSIG)]
            if hash.len() == 20 =>
        {
            Some((ScriptType::PubKeyHash, vec![hash.clone()]))
        }
        [Element::Op(OP_HASH160), Element::Push(hash), Element::Op(OP_EQUAL)] if hash.len() == 20 => {
            Some((ScriptType::ScriptHash, vec![hash.clone()]))
        }
        [Element::Op(first), rest @ .., Element::Op(last_n), Element::Op(OP_CHECKMULTISIG)] => {
            let required = small_int(*first)?;
            let total = small_int(*last_n)?;
            if required == 0 || required > total || rest.len() != total {
                return None;
            }
            let mut solutions = Vec::with_capacity(total + 2);
            solutions.push(vec![required as u8]);
            for element in rest {
                match element {
                    Element::Push(pubkey) if is_pubkey(pubkey) => solutions.push(pubkey.clone()),
                    _ => return None,
                }
            }
            solutions.push(vec![total as u8]);
            Some((ScriptType::Multisig, solutions))
        }
        [Element::Op(OP_RETURN)] => Some((ScriptType::NullData, Vec::new())),
        [Element::Op(OP_RETURN), Element::Push(data)] if data.len() <= MAX_NULL_DATA_SIZE => {
            Some((ScriptType::NullData, vec![data.clone()]))
        }
        _ => None,
    }
}

/// Signature slots an input script must fill for a classified output.
pub fn script_sig_args_expected(script_type: ScriptType, solutions: &[Vec<u8>]) -> Option<usize> {
    match script_type {
        ScriptType::PubKey => Some(1),
        ScriptType::PubKeyHash => Some(2),
        ScriptType::Multisig => {
            let required = *solutions.first()?.first()? as usize;
            // OP_CHECKMULTISIG consumes one extra dummy element.
            Some(required + 1)
        }
        ScriptType::ScriptHash | ScriptType::NullData => None,
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    match parse_elements(script) {
        Some(elements) => elements.iter().all(|element| match element {
            Element::Push(_) => true,
            Element::Op(op) => *op == OP_1NEGATE || small_int(*op).is_some(),
        }),
        None => false,
    }
}

/// The stack a push-only input script leaves behind.
pub fn pushed_stack(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let elements = parse_elements(script)?;
    let mut stack = Vec::with_capacity(elements.len());
    for element in elements {
        match element {
            Element::Push(data) => stack.push(data),
            Element::Op(op) => {
                if op == OP_1NEGATE {
                    stack.push(vec![0x81]);
                } else if let Some(value) = small_int(op) {
                    stack.push(vec![value as u8]);
                } else {
                    return None;
                }
            }
        }
    }
    Some(stack)
}

pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Legacy sig-op counting: every CHECKSIG counts 1, CHECKMULTISIG counts 20
/// unless `accurate` and preceded by a small integer. Walks raw opcodes and
/// tolerates truncated pushes.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_op = 0u8;
    let mut pos = 0usize;
    while pos < script.len() {
        let op = script[pos];
        let advance = match op {
            1..=0x4b => 1 + op as usize,
            OP_PUSHDATA1 => 2 + *script.get(pos + 1).unwrap_or(&0) as usize,
            OP_PUSHDATA2 => {
                let len = script
                    .get(pos + 1..pos + 3)
                    .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
                    .unwrap_or(script.len());
                3 + len
            }
            OP_PUSHDATA4 => {
                let len = script
                    .get(pos + 1..pos + 5)
                    .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
                    .unwrap_or(script.len());
                5 + len
            }
            _ => 1,
        };
        if op == OP_CHECKSIG || op == OP_CHECKSIGVERIFY {
            count += 1;
        } else if op == OP_CHECKMULTISIG || op == OP_CHECKMULTISIGVERIFY {
            count += match (accurate, small_int(last_op)) {
                (true, Some(n)) => n as u32,
                _ => 20,
            };
        }
        last_op = op;
        pos += advance;
    }
    count
}

/// Sig-ops contributed by a pay-to-script-hash redemption: the redeemed
/// script is the last push of the input script, counted accurately.
pub fn p2sh_sig_op_count(prev_script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_pay_to_script_hash(prev_script_pubkey) {
        return 0;
    }
    let Some(stack) = pushed_stack(script_sig) else {
        return 0;
    };
    let Some(redeem_script) = stack.last() else {
        return 0;
    };
    sig_op_count(redeem_script, true)
}

pub fn pay_to_pubkey_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    script.push(pubkey.len() as u8);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn pay_to_pubkey_hash_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}
