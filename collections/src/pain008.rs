//! ISO 20022 pain.008 message generation
//!
//! Serializes an approved batch to a pain.008.001.02
//! CustomerDirectDebitInitiation message, with one `PmtInf` block per
//! sequence type. The document is structurally validated before it is
//! handed to the transport; a validation failure blocks submission.
//!
//! # Example Output
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Document xmlns="urn:iso:std:iso:20022:tech:xsd:pain.008.001.02">
//!   <CstmrDrctDbtInitn>
//!     <GrpHdr>
//!       <MsgId>COL-20250107-001</MsgId>
//!       <CreDtTm>2025-01-05T09:00:00Z</CreDtTm>
//!       <NbOfTxs>2</NbOfTxs>
//!       <CtrlSum>55.00</CtrlSum>
//!     </GrpHdr>
//!     <PmtInf>
//!       <PmtTpInf><SeqTp>RCUR</SeqTp></PmtTpInf>
//!       <DrctDbtTxInf>...</DrctDbtTxInf>
//!     </PmtInf>
//!   </CstmrDrctDbtInitn>
//! </Document>
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::se::to_string as to_xml_string;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use dues_core::{CreditorConfig, SequenceType};

use crate::batch::{Batch, BatchEntry};
use crate::error::{Error, Result};

/// pain.008 message generator
pub struct Pain008Generator {
    creditor: CreditorConfig,
}

impl Pain008Generator {
    /// Create a generator for the configured creditor
    pub fn new(creditor: CreditorConfig) -> Self {
        Self { creditor }
    }

    /// Build, validate and serialize the message for `batch`
    pub fn generate(&self, batch: &Batch) -> Result<String> {
        let document = self.build_document(batch)?;
        validate(&document)?;
        let xml = to_xml_string(&document)
            .map_err(|e| Error::Iso20022(format!("XML serialization failed: {}", e)))?;
        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
            xml
        ))
    }

    fn build_document(&self, batch: &Batch) -> Result<Pain008Document> {
        if batch.entries.is_empty() {
            return Err(Error::Iso20022(format!(
                "Batch {} has no entries to serialize",
                batch.reference
            )));
        }

        // One PmtInf per sequence type, FRST before RCUR
        let mut payment_infos = Vec::new();
        for seq in [SequenceType::Frst, SequenceType::Rcur] {
            let entries: Vec<&BatchEntry> = batch
                .entries
                .iter()
                .filter(|e| e.sequence_type == seq)
                .collect();
            if entries.is_empty() {
                continue;
            }
            payment_infos.push(self.build_payment_info(batch, seq, &entries)?);
        }

        let group_header = GroupHeader {
            msg_id: batch.reference.clone(),
            cre_dt_tm: Utc::now(),
            nb_of_txs: batch.entry_count() as u32,
            ctrl_sum: batch.total_amount(),
            initg_pty: PartyName {
                nm: self.creditor.name.clone(),
            },
        };

        Ok(Pain008Document {
            xmlns: "urn:iso:std:iso:20022:tech:xsd:pain.008.001.02".to_string(),
            cstmr_drct_dbt_initn: CstmrDrctDbtInitn {
                grp_hdr: group_header,
                pmt_inf: payment_infos,
            },
        })
    }

    fn build_payment_info(
        &self,
        batch: &Batch,
        seq: SequenceType,
        entries: &[&BatchEntry],
    ) -> Result<PaymentInfo> {
        let transactions = entries
            .iter()
            .map(|e| self.build_transaction(e))
            .collect::<Result<Vec<_>>>()?;
        let ctrl_sum: Decimal = entries.iter().map(|e| e.amount).sum();

        Ok(PaymentInfo {
            pmt_inf_id: format!("{}-{}", batch.reference, seq.code()),
            pmt_mtd: "DD".to_string(),
            nb_of_txs: entries.len() as u32,
            ctrl_sum,
            pmt_tp_inf: PaymentTypeInfo {
                svc_lvl: CodeField {
                    cd: "SEPA".to_string(),
                },
                lcl_instrm: CodeField {
                    cd: "CORE".to_string(),
                },
                seq_tp: seq.code().to_string(),
            },
            reqd_colltn_dt: batch.collection_date,
            cdtr: PartyName {
                nm: self.creditor.name.clone(),
            },
            cdtr_acct: Account {
                id: AccountId {
                    iban: self.creditor.iban.clone(),
                },
            },
            cdtr_agt: Agent {
                fin_instn_id: FinancialInstitutionId {
                    bic: self.creditor.bic.clone(),
                },
            },
            chrg_br: "SLEV".to_string(),
            cdtr_schme_id: CreditorSchemeId {
                id: SchemeIdWrapper {
                    prvt_id: PrivateId {
                        othr: OtherId {
                            id: self.creditor.creditor_id.clone(),
                            schme_nm: SchemeName {
                                prtry: "SEPA".to_string(),
                            },
                        },
                    },
                },
            },
            drct_dbt_tx_inf: transactions,
        })
    }

    fn build_transaction(&self, entry: &BatchEntry) -> Result<DirectDebitTxInfo> {
        let end_to_end_id = entry.end_to_end_id.clone().ok_or_else(|| {
            Error::Iso20022(format!(
                "Entry for invoice {} has no end-to-end reference",
                entry.invoice
            ))
        })?;

        Ok(DirectDebitTxInfo {
            pmt_id: PaymentIdentification { end_to_end_id },
            instd_amt: AmountAndCurrency {
                ccy: "EUR".to_string(),
                value: entry.amount,
            },
            drct_dbt_tx: DirectDebitTx {
                mndt_rltd_inf: MandateRelatedInfo {
                    mndt_id: entry.mandate.to_string(),
                    dt_of_sgntr: entry.mandate_signed_at,
                },
            },
            dbtr_agt: Agent {
                fin_instn_id: FinancialInstitutionId {
                    bic: entry.bic.as_str().to_string(),
                },
            },
            dbtr: PartyName {
                nm: entry.debtor_name.clone(),
            },
            dbtr_acct: Account {
                id: AccountId {
                    iban: entry.iban.as_str().to_string(),
                },
            },
            rmt_inf: RemittanceInfo {
                ustrd: format!("Membership dues {}", entry.invoice),
            },
        })
    }
}

/// Structural validation, required before transmission
fn validate(document: &Pain008Document) -> Result<()> {
    let initiation = &document.cstmr_drct_dbt_initn;
    if initiation.pmt_inf.is_empty() {
        return Err(Error::Iso20022(
            "Message contains no payment information blocks".to_string(),
        ));
    }

    let mut tx_count = 0u32;
    let mut sum = Decimal::ZERO;
    for info in &initiation.pmt_inf {
        if info.drct_dbt_tx_inf.is_empty() {
            return Err(Error::Iso20022(format!(
                "PmtInf {} contains no transactions",
                info.pmt_inf_id
            )));
        }
        let block_sum: Decimal = info.drct_dbt_tx_inf.iter().map(|t| t.instd_amt.value).sum();
        if block_sum != info.ctrl_sum || info.drct_dbt_tx_inf.len() as u32 != info.nb_of_txs {
            return Err(Error::Iso20022(format!(
                "PmtInf {} control totals do not match its transactions",
                info.pmt_inf_id
            )));
        }
        for tx in &info.drct_dbt_tx_inf {
            if tx.pmt_id.end_to_end_id.is_empty() {
                return Err(Error::Iso20022(
                    "Transaction with empty end-to-end reference".to_string(),
                ));
            }
            if tx.instd_amt.value <= Decimal::ZERO {
                return Err(Error::Iso20022(format!(
                    "Transaction {} has non-positive amount",
                    tx.pmt_id.end_to_end_id
                )));
            }
        }
        tx_count += info.nb_of_txs;
        sum += info.ctrl_sum;
    }

    let header = &initiation.grp_hdr;
    if header.nb_of_txs != tx_count || header.ctrl_sum != sum {
        return Err(Error::Iso20022(format!(
            "Group header totals ({} txs, {}) do not match payment blocks ({} txs, {})",
            header.nb_of_txs, header.ctrl_sum, tx_count, sum
        )));
    }
    Ok(())
}

// ISO 20022 pain.008.001.02 structures

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "Document")]
struct Pain008Document {
    #[serde(rename = "@xmlns")]
    xmlns: String,

    #[serde(rename = "CstmrDrctDbtInitn")]
    cstmr_drct_dbt_initn: CstmrDrctDbtInitn,
}

#[derive(Debug, Serialize, Deserialize)]
struct CstmrDrctDbtInitn {
    #[serde(rename = "GrpHdr")]
    grp_hdr: GroupHeader,

    #[serde(rename = "PmtInf")]
    pmt_inf: Vec<PaymentInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupHeader {
    #[serde(rename = "MsgId")]
    msg_id: String,

    #[serde(rename = "CreDtTm")]
    cre_dt_tm: DateTime<Utc>,

    #[serde(rename = "NbOfTxs")]
    nb_of_txs: u32,

    #[serde(rename = "CtrlSum")]
    ctrl_sum: Decimal,

    #[serde(rename = "InitgPty")]
    initg_pty: PartyName,
}

#[derive(Debug, Serialize, Deserialize)]
struct PaymentInfo {
    #[serde(rename = "PmtInfId")]
    pmt_inf_id: String,

    #[serde(rename = "PmtMtd")]
    pmt_mtd: String,

    #[serde(rename = "NbOfTxs")]
    nb_of_txs: u32,

    #[serde(rename = "CtrlSum")]
    ctrl_sum: Decimal,

    #[serde(rename = "PmtTpInf")]
    pmt_tp_inf: PaymentTypeInfo,

    #[serde(rename = "ReqdColltnDt")]
    reqd_colltn_dt: NaiveDate,

    #[serde(rename = "Cdtr")]
    cdtr: PartyName,

    #[serde(rename = "CdtrAcct")]
    cdtr_acct: Account,

    #[serde(rename = "CdtrAgt")]
    cdtr_agt: Agent,

    #[serde(rename = "ChrgBr")]
    chrg_br: String,

    #[serde(rename = "CdtrSchmeId")]
    cdtr_schme_id: CreditorSchemeId,

    #[serde(rename = "DrctDbtTxInf")]
    drct_dbt_tx_inf: Vec<DirectDebitTxInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PaymentTypeInfo {
    #[serde(rename = "SvcLvl")]
    svc_lvl: CodeField,

    #[serde(rename = "LclInstrm")]
    lcl_instrm: CodeField,

    #[serde(rename = "SeqTp")]
    seq_tp: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CodeField {
    #[serde(rename = "Cd")]
    cd: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreditorSchemeId {
    #[serde(rename = "Id")]
    id: SchemeIdWrapper,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemeIdWrapper {
    #[serde(rename = "PrvtId")]
    prvt_id: PrivateId,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrivateId {
    #[serde(rename = "Othr")]
    othr: OtherId,
}

#[derive(Debug, Serialize, Deserialize)]
struct OtherId {
    #[serde(rename = "Id")]
    id: String,

    #[serde(rename = "SchmeNm")]
    schme_nm: SchemeName,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemeName {
    #[serde(rename = "Prtry")]
    prtry: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectDebitTxInfo {
    #[serde(rename = "PmtId")]
    pmt_id: PaymentIdentification,

    #[serde(rename = "InstdAmt")]
    instd_amt: AmountAndCurrency,

    #[serde(rename = "DrctDbtTx")]
    drct_dbt_tx: DirectDebitTx,

    #[serde(rename = "DbtrAgt")]
    dbtr_agt: Agent,

    #[serde(rename = "Dbtr")]
    dbtr: PartyName,

    #[serde(rename = "DbtrAcct")]
    dbtr_acct: Account,

    #[serde(rename = "RmtInf")]
    rmt_inf: RemittanceInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct PaymentIdentification {
    #[serde(rename = "EndToEndId")]
    end_to_end_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AmountAndCurrency {
    #[serde(rename = "@Ccy")]
    ccy: String,

    #[serde(rename = "$text")]
    value: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectDebitTx {
    #[serde(rename = "MndtRltdInf")]
    mndt_rltd_inf: MandateRelatedInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct MandateRelatedInfo {
    #[serde(rename = "MndtId")]
    mndt_id: String,

    #[serde(rename = "DtOfSgntr")]
    dt_of_sgntr: NaiveDate,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartyName {
    #[serde(rename = "Nm")]
    nm: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Account {
    #[serde(rename = "Id")]
    id: AccountId,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountId {
    #[serde(rename = "IBAN")]
    iban: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Agent {
    #[serde(rename = "FinInstnId")]
    fin_instn_id: FinancialInstitutionId,
}

#[derive(Debug, Serialize, Deserialize)]
struct FinancialInstitutionId {
    #[serde(rename = "BIC")]
    bic: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemittanceInfo {
    #[serde(rename = "Ustrd")]
    ustrd: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dues_core::{Bic, Iban, InvoiceId, MandateId, MemberId, RiskClass};
    use uuid::Uuid;

    fn entry(invoice: &str, amount: i64, seq: SequenceType) -> BatchEntry {
        BatchEntry {
            invoice: InvoiceId::new(invoice),
            mandate: MandateId::parse("M-001").unwrap(),
            member: MemberId::new("MEM-1"),
            debtor_name: "J. Jansen".to_string(),
            iban: Iban::parse("NL91ABNA0417164300").unwrap(),
            bic: Bic::parse("ABNANL2A").unwrap(),
            amount: Decimal::new(amount, 0),
            sequence_type: seq,
            risk: RiskClass::Low,
            mandate_signed_at: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            attempt_id: Some(Uuid::new_v4()),
            end_to_end_id: Some(format!("{}-1", invoice)),
            outcome: None,
            reason_code: None,
        }
    }

    fn batch(entries: Vec<BatchEntry>) -> Batch {
        Batch::new(1, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap(), entries)
    }

    #[test]
    fn test_generates_one_pmtinf_per_sequence_type() {
        let generator = Pain008Generator::new(CreditorConfig::default());
        let batch = batch(vec![
            entry("INV-1", 25, SequenceType::Frst),
            entry("INV-2", 30, SequenceType::Rcur),
            entry("INV-3", 35, SequenceType::Rcur),
        ]);

        let xml = generator.generate(&batch).unwrap();
        assert!(xml.contains("<?xml version"));
        assert!(xml.contains("pain.008.001.02"));
        assert!(xml.contains("<SeqTp>FRST</SeqTp>"));
        assert!(xml.contains("<SeqTp>RCUR</SeqTp>"));
        assert_eq!(xml.matches("<PmtInf>").count(), 2);
        assert!(xml.contains("<EndToEndId>INV-1-1</EndToEndId>"));
        assert!(xml.contains("NL91ABNA0417164300"));
    }

    #[test]
    fn test_missing_end_to_end_reference_blocks_generation() {
        let generator = Pain008Generator::new(CreditorConfig::default());
        let mut unsubmitted = entry("INV-1", 25, SequenceType::Rcur);
        unsubmitted.end_to_end_id = None;

        let result = generator.generate(&batch(vec![unsubmitted]));
        assert!(matches!(result, Err(Error::Iso20022(_))));
    }

    #[test]
    fn test_empty_batch_blocks_generation() {
        let generator = Pain008Generator::new(CreditorConfig::default());
        let result = generator.generate(&batch(vec![]));
        assert!(matches!(result, Err(Error::Iso20022(_))));
    }

    #[test]
    fn test_validation_catches_mismatched_control_sum() {
        let generator = Pain008Generator::new(CreditorConfig::default());
        let batch = batch(vec![entry("INV-1", 25, SequenceType::Rcur)]);
        let mut document = generator.build_document(&batch).unwrap();
        document.cstmr_drct_dbt_initn.grp_hdr.ctrl_sum = Decimal::new(999, 0);
        assert!(validate(&document).is_err());
    }

    #[test]
    fn test_control_totals_match_entries() {
        let generator = Pain008Generator::new(CreditorConfig::default());
        let batch = batch(vec![
            entry("INV-1", 25, SequenceType::Rcur),
            entry("INV-2", 30, SequenceType::Rcur),
        ]);
        let document = generator.build_document(&batch).unwrap();
        assert_eq!(document.cstmr_drct_dbt_initn.grp_hdr.nb_of_txs, 2);
        assert_eq!(
            document.cstmr_drct_dbt_initn.grp_hdr.ctrl_sum,
            Decimal::new(55, 0)
        );
        assert!(validate(&document).is_ok());
    }
}
