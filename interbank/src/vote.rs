//! Vote engine for inbound proposals
//!
//! Voting never mutates balances. The checks run in a fixed order and the
//! first failing one decides the vote:
//!
//! 1. posting count must be 2 or 4 (`NO_POSTINGS`)
//! 2. every posting must be well formed (`NO_SUCH_ACCOUNT` for an account
//!    without a number, `INVALID_POSTING_FORMAT` for an empty party id or a
//!    zero monetary amount)
//! 3. monetary legs must carry one supported currency (`NO_SUCH_ASSET`)
//! 4. any non-monetary leg hands the whole proposal to the oracle
//! 5. every leg aimed at this bank must resolve to an account in that
//!    currency (`NO_SUCH_USER` / `NO_SUCH_ACCOUNT`), and at least one must
//!    exist (`NO_SUCH_ACCOUNT`); a 2-posting transfer may have only one
//!    (`INVALID_POSTING_FORMAT`)

use crate::oracle::ValuationOracle;
use crate::protocol::{Asset, Envelope, Posting, ReasonCode, Transaction, TxAccount, Vote};
use crate::resolve::{AccountResolver, Resolution};
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// Outcome of local evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// This bank decides
    Vote(Vote),
    /// The oracle decides
    Forward,
}

/// Decides how this bank votes on a NEW_TX
pub struct VoteEngine {
    resolver: AccountResolver,
    oracle: Arc<dyn ValuationOracle>,
}

impl VoteEngine {
    /// Create engine
    pub fn new(resolver: AccountResolver, oracle: Arc<dyn ValuationOracle>) -> Self {
        Self { resolver, oracle }
    }

    /// Vote, consulting the oracle when the proposal carries non-monetary legs
    pub async fn vote(&self, proposal: &Envelope<Transaction>) -> Result<Vote> {
        match self.evaluate(&proposal.message).await? {
            Verdict::Vote(vote) => Ok(vote),
            Verdict::Forward => {
                debug!(
                    transaction_id = %proposal.message.transaction_id,
                    "Forwarding proposal to valuation oracle"
                );
                self.oracle.vote(proposal).await
            }
        }
    }

    /// Local decision without calling the oracle
    pub async fn evaluate(&self, tx: &Transaction) -> Result<Verdict> {
        let count = tx.postings.len();
        if count != 2 && count != 4 {
            return Ok(reject(ReasonCode::NoPostings, None));
        }

        for posting in &tx.postings {
            if let Some(code) = malformed(posting) {
                return Ok(reject(code, Some(posting)));
            }
        }

        let mut code: Option<&str> = None;
        for posting in &tx.postings {
            let Asset::Monetary(asset) = &posting.asset else {
                continue;
            };
            match (asset.currency.as_deref(), code) {
                (None, _) | (Some(""), _) => return Ok(reject(ReasonCode::NoSuchAsset, Some(posting))),
                (Some(c), Some(first)) if c != first => {
                    return Ok(reject(ReasonCode::NoSuchAsset, Some(posting)))
                }
                (Some(c), _) => code = Some(c),
            }
        }

        if tx.postings.iter().any(|p| !p.asset.is_monetary()) {
            return Ok(Verdict::Forward);
        }

        // Every leg is monetary here, so a code was seen
        let Some(code) = code else {
            return Ok(reject(ReasonCode::NoSuchAsset, None));
        };
        let Ok(currency) = self.resolver.currency(code) else {
            return Ok(reject(ReasonCode::NoSuchAsset, tx.postings.first()));
        };

        let mut local = 0;
        for posting in &tx.postings {
            match self.resolver.resolve(&posting.account, currency).await? {
                Resolution::Local(_) => {
                    local += 1;
                    // A plain transfer settles one leg here and one at the peer
                    if count == 2 && local > 1 {
                        return Ok(reject(ReasonCode::InvalidPostingFormat, Some(posting)));
                    }
                }
                Resolution::Foreign => {}
                Resolution::Missing(code) => return Ok(reject(code, Some(posting))),
            }
        }

        if local == 0 {
            return Ok(reject(ReasonCode::NoSuchAccount, None));
        }
        Ok(Verdict::Vote(Vote::yes()))
    }
}

fn reject(code: ReasonCode, posting: Option<&Posting>) -> Verdict {
    Verdict::Vote(Vote::no(code, posting.cloned()))
}

fn malformed(posting: &Posting) -> Option<ReasonCode> {
    match &posting.account {
        TxAccount::Account { num: None } => Some(ReasonCode::NoSuchAccount),
        TxAccount::Account { num: Some(num) } if num.is_empty() => Some(ReasonCode::NoSuchAccount),
        TxAccount::Person { id } | TxAccount::OptionContract { id } if id.id.is_empty() => {
            Some(ReasonCode::InvalidPostingFormat)
        }
        _ if posting.asset.is_monetary() && posting.amount.is_zero() => {
            Some(ReasonCode::InvalidPostingFormat)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Decision, ForeignBankId, IdempotenceKey, MessageType};
    use crate::Error;
    use async_trait::async_trait;
    use ledger_core::{Account, Config, Currency, Ledger};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedOracle {
        vote: Option<Vote>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ValuationOracle for FixedOracle {
        async fn vote(&self, _proposal: &Envelope<Transaction>) -> Result<Vote> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vote
                .clone()
                .ok_or_else(|| Error::OracleUnreachable("down".to_string()))
        }

        async fn notify_commit(&self, _proposal: &Envelope<Transaction>) -> Result<()> {
            Ok(())
        }
    }

    async fn engine(oracle_vote: Option<Vote>) -> (VoteEngine, Arc<FixedOracle>) {
        let ledger = Ledger::start(Config::default());
        ledger
            .open_account(Account::open("222-X", "p1", Currency::EUR, dec!(0)))
            .await
            .unwrap();
        let ledger = Arc::new(ledger);
        let oracle = Arc::new(FixedOracle {
            vote: oracle_vote,
            calls: AtomicUsize::new(0),
        });
        let resolver = AccountResolver::new(222, ledger.clone(), ledger);
        (VoteEngine::new(resolver, oracle.clone()), oracle)
    }

    fn money(account: TxAccount, amount: Decimal, currency: Option<&str>) -> Posting {
        Posting {
            account,
            amount,
            asset: Asset::Monetary(crate::protocol::MonetaryAsset {
                currency: currency.map(str::to_string),
            }),
        }
    }

    fn num(n: &str) -> TxAccount {
        TxAccount::Account {
            num: Some(n.to_string()),
        }
    }

    fn person(routing: u32, id: &str) -> TxAccount {
        TxAccount::Person {
            id: ForeignBankId::new(routing, id),
        }
    }

    fn tx(postings: Vec<Posting>) -> Envelope<Transaction> {
        Envelope {
            idempotence_key: IdempotenceKey::new(111, "k"),
            message_type: MessageType::NewTx,
            message: Transaction {
                postings,
                message: "test".to_string(),
                transaction_id: ForeignBankId::new(111, "k"),
                timestamp: None,
            },
        }
    }

    fn transfer_to(to: TxAccount, currency: &str) -> Vec<Posting> {
        vec![
            money(num("111-A"), dec!(-100), Some(currency)),
            money(to, dec!(100), Some(currency)),
        ]
    }

    #[tokio::test]
    async fn test_yes_for_local_person() {
        let (engine, oracle) = engine(None).await;
        let vote = engine.vote(&tx(transfer_to(person(222, "p1"), "EUR"))).await.unwrap();
        assert_eq!(vote, Vote::yes());
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);

        let vote = engine.vote(&tx(transfer_to(num("222-X"), "EUR"))).await.unwrap();
        assert!(vote.is_yes());
    }

    #[tokio::test]
    async fn test_posting_count() {
        let (engine, _) = engine(None).await;
        for n in [0usize, 1, 3, 5] {
            let postings = (0..n)
                .map(|_| money(person(222, "p1"), dec!(1), Some("EUR")))
                .collect();
            let vote = engine.vote(&tx(postings)).await.unwrap();
            assert_eq!(vote.vote, Decision::No);
            assert_eq!(vote.first_reason(), Some(&ReasonCode::NoPostings));
        }
    }

    #[tokio::test]
    async fn test_currency_checks() {
        let (engine, _) = engine(None).await;

        let mixed = vec![
            money(num("111-A"), dec!(-100), Some("EUR")),
            money(person(222, "p1"), dec!(100), Some("USD")),
        ];
        let vote = engine.vote(&tx(mixed)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAsset));
        assert_eq!(
            vote.reasons[0].posting.as_ref().map(|p| p.amount),
            Some(dec!(100))
        );

        let missing = vec![
            money(num("111-A"), dec!(-100), None),
            money(person(222, "p1"), dec!(100), None),
        ];
        let vote = engine.vote(&tx(missing)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAsset));

        let unsupported = transfer_to(person(222, "p1"), "XAU");
        let vote = engine.vote(&tx(unsupported)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAsset));
    }

    #[tokio::test]
    async fn test_unresolvable_local_parties() {
        let (engine, _) = engine(None).await;

        let vote = engine
            .vote(&tx(transfer_to(person(222, "ghost"), "EUR")))
            .await
            .unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchUser));

        let vote = engine
            .vote(&tx(transfer_to(person(222, "p1"), "GBP")))
            .await
            .unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAccount));

        let vote = engine
            .vote(&tx(transfer_to(num("222-NOPE"), "EUR")))
            .await
            .unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAccount));

        // Neither leg is ours
        let vote = engine
            .vote(&tx(transfer_to(person(333, "p1"), "EUR")))
            .await
            .unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAccount));
        assert!(vote.reasons[0].posting.is_none());
    }

    #[tokio::test]
    async fn test_malformed_postings() {
        let (engine, _) = engine(None).await;

        let no_number = transfer_to(TxAccount::Account { num: None }, "EUR");
        let vote = engine.vote(&tx(no_number)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::NoSuchAccount));

        let empty_person = transfer_to(person(222, ""), "EUR");
        let vote = engine.vote(&tx(empty_person)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::InvalidPostingFormat));

        let zero = vec![
            money(num("111-A"), dec!(0), Some("EUR")),
            money(person(222, "p1"), dec!(0), Some("EUR")),
        ];
        let vote = engine.vote(&tx(zero)).await.unwrap();
        assert_eq!(vote.first_reason(), Some(&ReasonCode::InvalidPostingFormat));
        assert_eq!(
            vote.reasons[0].posting.as_ref().map(|p| p.amount),
            Some(dec!(0))
        );
    }

    #[tokio::test]
    async fn test_transfer_between_two_local_accounts() {
        let (engine, _) = engine(None).await;
        let postings = vec![
            money(num("222-X"), dec!(-100), Some("EUR")),
            money(person(222, "p1"), dec!(100), Some("EUR")),
        ];
        let vote = engine.vote(&tx(postings)).await.unwrap();
        assert_eq!(vote.vote, Decision::No);
        assert_eq!(vote.first_reason(), Some(&ReasonCode::InvalidPostingFormat));
        assert_eq!(
            vote.reasons[0].posting.as_ref().map(|p| p.amount),
            Some(dec!(100))
        );
    }

    #[tokio::test]
    async fn test_non_monetary_forwarded_verbatim() {
        let oracle_vote = Vote::no(ReasonCode::Other("OPTION_EXPIRED".to_string()), None);
        let (engine, oracle) = engine(Some(oracle_vote.clone())).await;

        let stock = Asset::Stock(json!({"ticker": "AAPL"}));
        let postings = vec![
            money(person(222, "p1"), dec!(-500), Some("EUR")),
            money(person(111, "seller"), dec!(500), Some("EUR")),
            Posting {
                account: person(222, "p1"),
                amount: dec!(10),
                asset: stock.clone(),
            },
            Posting {
                account: person(111, "seller"),
                amount: dec!(-10),
                asset: stock,
            },
        ];
        let vote = engine.vote(&tx(postings)).await.unwrap();
        assert_eq!(vote, oracle_vote);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_oracle_down_is_an_error() {
        let (engine, _) = engine(None).await;
        let postings = vec![
            money(person(222, "p1"), dec!(-500), Some("EUR")),
            Posting {
                account: person(222, "p1"),
                amount: dec!(10),
                asset: Asset::OptionContract(json!({"negotiationId": {"routingNumber": 111, "id": "n"}})),
            },
        ];
        assert!(matches!(
            engine.vote(&tx(postings)).await,
            Err(Error::OracleUnreachable(_))
        ));
    }
}
